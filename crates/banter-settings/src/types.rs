//! Settings type definitions.
//!
//! Every section implements [`Default`] with production values and accepts
//! partial JSON via `#[serde(default)]`. Field names are camelCase.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root settings for a gateway instance.
///
/// ```json
/// {
///   "server": { "port": 9870 },
///   "channels": { "windowSize": 128 },
///   "cluster": { "brokerAddr": "10.0.0.5:9871" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BanterSettings {
    /// Settings schema version.
    pub version: String,
    /// HTTP/WebSocket listener settings.
    pub server: ServerSettings,
    /// Channel streaming policy knobs.
    pub channels: ChannelSettings,
    /// Session and presence TTLs.
    pub presence: PresenceSettings,
    /// Cluster bridge and broker settings.
    pub cluster: ClusterSettings,
    /// Credential validation settings.
    pub auth: AuthSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for BanterSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            server: ServerSettings::default(),
            channels: ChannelSettings::default(),
            presence: PresenceSettings::default(),
            cluster: ClusterSettings::default(),
            auth: AuthSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listener port (0 = ephemeral, used by tests).
    pub port: u16,
    /// Maximum concurrent WebSocket connections; upgrades beyond this are
    /// rejected with 503.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// WebSocket ping cadence, seconds.
    pub heartbeat_interval_secs: u64,
    /// Silence window after which a connection is considered dead, seconds.
    pub heartbeat_timeout_secs: u64,
    /// Per-connection outbound queue depth; overflow closes the connection.
    pub outbound_queue_depth: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9870,
            max_connections: 1024,
            max_message_size: 256 * 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            outbound_queue_depth: 256,
        }
    }
}

impl ServerSettings {
    /// Ping cadence as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Dead-connection window as a [`Duration`].
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Channel streaming policy knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    /// Events retained per channel for backfill; oldest dropped first.
    pub window_size: usize,
    /// How long an out-of-order arrival may wait for its predecessor before
    /// the hole is declared a gap and backfill starts, milliseconds.
    pub reorder_timeout_ms: u64,
    /// Closed, subscriber-free channels are evicted after this long, seconds.
    pub idle_channel_secs: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            window_size: 512,
            reorder_timeout_ms: 500,
            idle_channel_secs: 900,
        }
    }
}

impl ChannelSettings {
    /// Reorder wait as a [`Duration`].
    #[must_use]
    pub fn reorder_timeout(&self) -> Duration {
        Duration::from_millis(self.reorder_timeout_ms)
    }

    /// Idle eviction horizon as a [`Duration`].
    #[must_use]
    pub fn idle_channel(&self) -> Duration {
        Duration::from_secs(self.idle_channel_secs)
    }
}

/// Session and presence TTLs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Session TTL; a session whose connections are all silent this long is
    /// evicted, seconds.
    pub session_ttl_secs: u64,
    /// Cadence of the idempotent expiry sweep, seconds.
    pub sweep_interval_secs: u64,
    /// `typing` decays back to `online` after this long, seconds.
    pub typing_ttl_secs: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: 90,
            sweep_interval_secs: 30,
            typing_ttl_secs: 6,
        }
    }
}

impl PresenceSettings {
    /// Session TTL as a [`Duration`].
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Sweep cadence as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Typing decay as a [`Duration`].
    #[must_use]
    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.typing_ttl_secs)
    }
}

/// Cluster bridge and broker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// Stable instance id; minted (UUID v7) when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Broker address (`host:port`). Absent → in-process broker,
    /// single-instance mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_addr: Option<String>,
    /// Run the TCP broker inside this process and serve peers.
    pub embedded_broker: bool,
    /// Sequence-lease TTL; bounds the failover takeover window,
    /// milliseconds.
    pub lease_ttl_ms: u64,
    /// Store request timeout, milliseconds.
    pub request_timeout_ms: u64,
    /// Broker connect timeout, milliseconds.
    pub connect_timeout_ms: u64,
    /// Reconnect backoff tuning.
    pub retry: RetrySettings,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            instance_id: None,
            broker_addr: None,
            embedded_broker: false,
            lease_ttl_ms: 10_000,
            request_timeout_ms: 2_000,
            connect_timeout_ms: 3_000,
            retry: RetrySettings::default(),
        }
    }
}

impl ClusterSettings {
    /// Lease TTL as a [`Duration`].
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Store request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Broker dial timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconnect backoff tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// First retry delay, milliseconds.
    pub base_delay_ms: u64,
    /// Delay ceiling, milliseconds.
    pub max_delay_ms: u64,
    /// Random jitter as a fraction of the computed delay (0.0–1.0).
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
        }
    }
}

/// Credential validation settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret shared with the platform's auth service. When absent,
    /// only `staticTokens` entries authenticate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Fixed token → identity map for dev deployments.
    pub static_tokens: HashMap<String, StaticTokenEntry>,
}

/// One entry of the dev token map.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticTokenEntry {
    /// User id the token proves.
    pub user_id: String,
    /// Roles granted to that user.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default tracing filter (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = BanterSettings::default();
        assert_eq!(settings.server.port, 9870);
        assert_eq!(settings.channels.window_size, 512);
        assert_eq!(settings.channels.reorder_timeout_ms, 500);
        assert_eq!(settings.presence.session_ttl_secs, 90);
        assert!(settings.presence.sweep_interval_secs < settings.presence.session_ttl_secs);
        assert_eq!(settings.cluster.lease_ttl_ms, 10_000);
        assert!(settings.cluster.broker_addr.is_none());
        assert!(settings.auth.jwt_secret.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: BanterSettings =
            serde_json::from_str(r#"{"server":{"port":8000},"channels":{"windowSize":64}}"#)
                .unwrap();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.channels.window_size, 64);
        assert_eq!(settings.channels.reorder_timeout_ms, 500);
    }

    #[test]
    fn field_names_are_camel_case() {
        let json = serde_json::to_value(BanterSettings::default()).unwrap();
        assert!(json["server"].get("maxConnections").is_some());
        assert!(json["channels"].get("windowSize").is_some());
        assert!(json["channels"].get("reorderTimeoutMs").is_some());
        assert!(json["presence"].get("sessionTtlSecs").is_some());
        assert!(json["cluster"].get("leaseTtlMs").is_some());
    }

    #[test]
    fn optional_cluster_fields_omitted_when_none() {
        let json = serde_json::to_string(&ClusterSettings::default()).unwrap();
        assert!(!json.contains("instanceId"));
        assert!(!json.contains("brokerAddr"));
    }

    #[test]
    fn duration_helpers() {
        let settings = BanterSettings::default();
        assert_eq!(settings.channels.reorder_timeout(), Duration::from_millis(500));
        assert_eq!(settings.presence.session_ttl(), Duration::from_secs(90));
        assert_eq!(settings.cluster.lease_ttl(), Duration::from_millis(10_000));
        assert_eq!(settings.server.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn static_token_entry_roundtrip() {
        let entry: StaticTokenEntry =
            serde_json::from_str(r#"{"userId":"alice","roles":["member"]}"#).unwrap();
        assert_eq!(entry.user_id, "alice");
        assert_eq!(entry.roles, vec!["member".to_string()]);

        let bare: StaticTokenEntry = serde_json::from_str(r#"{"userId":"bob"}"#).unwrap();
        assert!(bare.roles.is_empty());
    }
}
