//! # banter-gateway
//!
//! Gateway binary — wires the event distribution crates together and
//! serves WebSocket and HTTP traffic until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use banter_auth::{AllowAuthenticated, JwtValidator, StaticTokenValidator, TokenValidator};
use banter_channels::ChannelHub;
use banter_cluster::{BridgeState, BrokerLink, BrokerServer, ClusterBridge, MemoryBroker};
use banter_core::{Identity, InstanceId};
use banter_presence::{PresenceTracker, SessionRegistry};
use banter_server::metrics::BRIDGE_DEGRADED;
use banter_server::presence_bridge::run_presence_bridge;
use banter_server::server::GatewayServer;
use banter_server::websocket::manager::watch_evictions;
use banter_settings::{
    load_settings, load_settings_from_path, AuthSettings, BanterSettings, LoggingSettings,
};

/// Banter real-time gateway.
#[derive(Parser, Debug)]
#[command(name = "banter-gateway", about = "Banter real-time event gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Broker address to join, `host:port` (overrides settings).
    #[arg(long)]
    broker_addr: Option<String>,

    /// Serve the TCP broker from this process.
    #[arg(long)]
    embedded_broker: bool,

    /// Stable instance id; minted when omitted.
    #[arg(long)]
    instance_id: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Fold flags into loaded settings. Flags win over file and env.
    fn apply(&self, settings: &mut BanterSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(addr) = &self.broker_addr {
            settings.cluster.broker_addr = Some(addr.clone());
        }
        if self.embedded_broker {
            settings.cluster.embedded_broker = true;
        }
        if let Some(id) = &self.instance_id {
            settings.cluster.instance_id = Some(id.clone());
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

fn init_logging(settings: &LoggingSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.level));
    if settings.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Pick the token validator from auth settings: a JWT secret enables
/// HS256 verification, otherwise the static dev-token map is used.
fn build_validator(settings: &AuthSettings) -> Arc<dyn TokenValidator> {
    if let Some(secret) = &settings.jwt_secret {
        info!("jwt credential validation enabled");
        return Arc::new(JwtValidator::new(secret));
    }

    let mut validator = StaticTokenValidator::new();
    for (token, entry) in &settings.static_tokens {
        validator = validator.with_token(
            token.clone(),
            Identity::new(entry.user_id.as_str(), entry.roles.clone()),
        );
    }
    warn!(
        tokens = settings.static_tokens.len(),
        "no jwt secret configured, using static dev tokens"
    );
    Arc::new(validator)
}

/// The cluster bridge plus the embedded broker's handles, when one runs
/// in this process.
struct BrokerRuntime {
    bridge: Arc<dyn ClusterBridge>,
    broker_cancel: Option<CancellationToken>,
    broker_task: Option<JoinHandle<()>>,
}

/// Wire the cluster bridge in one of three modes: embedded TCP broker,
/// remote TCP broker, or in-process single-instance.
async fn wire_bridge(settings: &BanterSettings, instance: InstanceId) -> Result<BrokerRuntime> {
    let cluster = &settings.cluster;

    if cluster.embedded_broker {
        let bind = cluster.broker_addr.as_deref().unwrap_or("127.0.0.1:0");
        let broker = BrokerServer::bind(bind, settings.channels.window_size)
            .await
            .context("failed to bind embedded broker")?;
        let addr = broker.local_addr();
        let cancel = broker.cancel_token();
        let task = tokio::spawn(broker.run());
        info!(%addr, "embedded broker serving peers");

        // The local gateway joins its own broker over TCP, same as peers.
        let link = BrokerLink::open(addr.to_string(), instance, cluster);
        if !link
            .wait_for_state(BridgeState::Connected, cluster.connect_timeout())
            .await
        {
            warn!("embedded broker link not up after connect timeout");
        }
        return Ok(BrokerRuntime {
            bridge: link,
            broker_cancel: Some(cancel),
            broker_task: Some(task),
        });
    }

    if let Some(addr) = &cluster.broker_addr {
        let link = BrokerLink::open(addr.clone(), instance, cluster);
        if link
            .wait_for_state(BridgeState::Connected, cluster.connect_timeout())
            .await
        {
            info!(%addr, "joined broker");
        } else {
            warn!(%addr, "broker unreachable at startup, running degraded until it appears");
        }
        return Ok(BrokerRuntime {
            bridge: link,
            broker_cancel: None,
            broker_task: None,
        });
    }

    info!("no broker configured, single-instance mode");
    let broker = MemoryBroker::new(settings.channels.window_size);
    Ok(BrokerRuntime {
        bridge: broker.bridge(instance),
        broker_cancel: None,
        broker_task: None,
    })
}

/// Mirror the bridge state into the degraded gauge and the log.
fn watch_bridge_state(
    bridge: Arc<dyn ClusterBridge>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut states = bridge.watch_state();
        loop {
            let degraded = *states.borrow_and_update() == BridgeState::Degraded;
            metrics::gauge!(BRIDGE_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
            if degraded {
                warn!("broker link degraded, cross-instance fan-out paused");
            } else {
                info!("broker link connected");
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = match &args.settings {
        Some(path) => load_settings_from_path(path).context("failed to load settings")?,
        None => load_settings().context("failed to load settings")?,
    };
    args.apply(&mut settings);
    let settings = Arc::new(settings);

    init_logging(&settings.logging);
    let metrics_handle = banter_server::metrics::install_recorder();

    let instance = settings
        .cluster
        .instance_id
        .as_deref()
        .map_or_else(InstanceId::new, InstanceId::from);
    info!(instance_id = %instance, version = env!("CARGO_PKG_VERSION"), "starting banter gateway");

    let broker = wire_bridge(&settings, instance).await?;
    let bridge = Arc::clone(&broker.bridge);

    let (tracker, presence_changes) =
        PresenceTracker::new(Arc::clone(&bridge), settings.presence.clone());
    let registry = SessionRegistry::new(
        Arc::clone(&bridge),
        Arc::clone(&tracker),
        settings.presence.clone(),
    );
    let (hub, evictions) = ChannelHub::new(
        Arc::clone(&bridge),
        settings.channels.clone(),
        settings.cluster.lease_ttl(),
    );

    let validator = build_validator(&settings.auth);
    let server = GatewayServer::new(
        Arc::clone(&settings),
        Arc::clone(&bridge),
        Arc::clone(&hub),
        Arc::clone(&registry),
        Arc::clone(&tracker),
        validator,
        Arc::new(AllowAuthenticated),
        metrics_handle,
    );
    let shutdown = Arc::clone(server.shutdown());

    // Channel-fed pumps end when their producers drop; aborted at shutdown.
    let evictions_task = watch_evictions(Arc::clone(server.manager()), evictions);
    let presence_task = run_presence_bridge(
        Arc::clone(&hub),
        Arc::clone(server.manager()),
        presence_changes,
    );
    // Token-observing tasks drain on the coordinator.
    let sweeper_task = registry.run_sweeper(shutdown.token());
    let bridge_watch_task = watch_bridge_state(Arc::clone(&bridge), shutdown.token());

    let (addr, serve_task) = server.listen().await.context("failed to bind gateway")?;
    info!("banter gateway listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    // Triggering the coordinator closes every session (1001 going away)
    // and stops the listener; then release leases and drop the broker.
    let drained = shutdown.drain(vec![sweeper_task, bridge_watch_task], None).await;
    if !drained {
        warn!("background tasks did not stop before the drain timeout");
    }
    evictions_task.abort();
    presence_task.abort();

    hub.shutdown().await;
    bridge.shutdown().await;
    if let Some(cancel) = broker.broker_cancel {
        cancel.cancel();
    }
    if let Some(task) = broker.broker_task {
        let _ = task.await;
    }
    let _ = serve_task.await;

    info!("shutdown complete");
    Ok(())
}
