//! `/health` endpoint.

use std::time::Instant;

use banter_cluster::BridgeState;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the gateway is running.
    pub status: String,
    /// Seconds since the gateway started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count on this instance.
    pub connections: usize,
    /// Sessions alive in the registry, cluster-wide.
    pub active_sessions: u64,
    /// Channels with local subscribers on this instance.
    pub channels: usize,
    /// Broker link state: `"connected"` or `"degraded"`.
    pub bridge: String,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    sessions: u64,
    channels: usize,
    bridge: BridgeState,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
        channels,
        bridge: match bridge {
            BridgeState::Connected => "connected".into(),
            BridgeState::Degraded => "degraded".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, 0, 0, BridgeState::Connected);
        assert_eq!(resp.status, "ok");
    }

    #[test]
    fn uptime_starts_at_zero() {
        let resp = health_check(Instant::now(), 0, 0, 0, BridgeState::Connected);
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, 0, 0, 0, BridgeState::Connected);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn counters_tracked() {
        let resp = health_check(Instant::now(), 5, 3, 2, BridgeState::Connected);
        assert_eq!(resp.connections, 5);
        assert_eq!(resp.active_sessions, 3);
        assert_eq!(resp.channels, 2);
    }

    #[test]
    fn degraded_bridge_reported() {
        let resp = health_check(Instant::now(), 0, 0, 0, BridgeState::Degraded);
        assert_eq!(resp.bridge, "degraded");
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), 2, 1, 1, BridgeState::Connected);
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 2);
        assert_eq!(parsed["active_sessions"], 1);
        assert_eq!(parsed["bridge"], "connected");
        assert!(parsed["uptime_secs"].is_number());
    }
}
