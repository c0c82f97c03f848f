//! `GatewayServer` — Axum HTTP + WebSocket gateway.
//!
//! Routes:
//!
//! - `GET /ws` — WebSocket upgrade, authenticated before the handshake
//! - `GET /health` — liveness and counters
//! - `GET /metrics` — Prometheus text
//! - `POST /v1/channels/{channel_id}/events` — internal event ingest
//! - `POST /v1/channels/{channel_id}/reopen` — clear a terminal close
//! - `GET /v1/presence/{user_id}` — canonical presence read

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use banter_auth::{ChannelAuthorizer, TokenValidator};
use banter_channels::ChannelHub;
use banter_cluster::ClusterBridge;
use banter_core::{ChannelId, PublishError, UserId, codes};
use banter_events::EventKind;
use banter_presence::{PresenceTracker, SessionRegistry};
use banter_settings::BanterSettings;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::manager::ConnectionManager;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Channel fan-out hub.
    pub hub: Arc<ChannelHub>,
    /// Session registry.
    pub registry: Arc<SessionRegistry>,
    /// Presence tracker.
    pub tracker: Arc<PresenceTracker>,
    /// Credential validator for the upgrade handshake.
    pub validator: Arc<dyn TokenValidator>,
    /// Channel subscription policy.
    pub authorizer: Arc<dyn ChannelAuthorizer>,
    /// Live connection registry.
    pub manager: Arc<ConnectionManager>,
    /// Cluster broker link.
    pub bridge: Arc<dyn ClusterBridge>,
    /// Gateway settings.
    pub settings: Arc<BanterSettings>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the gateway started.
    pub start_time: Instant,
    /// Renders the `/metrics` endpoint.
    pub metrics: PrometheusHandle,
}

/// The gateway server.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    /// Assemble a server around already-wired components.
    pub fn new(
        settings: Arc<BanterSettings>,
        bridge: Arc<dyn ClusterBridge>,
        hub: Arc<ChannelHub>,
        registry: Arc<SessionRegistry>,
        tracker: Arc<PresenceTracker>,
        validator: Arc<dyn TokenValidator>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        metrics: PrometheusHandle,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new(settings.server.max_connections));
        let state = AppState {
            hub,
            registry,
            tracker,
            validator,
            authorizer,
            manager,
            bridge,
            settings,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics,
        };
        Self { state }
    }

    /// A clone of the shared handler state.
    #[must_use]
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// The connection registry.
    #[must_use]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.state.manager
    }

    /// The shutdown coordinator.
    #[must_use]
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Build the Axum router with all routes.
    #[must_use]
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown triggers.
    ///
    /// Returns the bound address (the configured port may be `0`) and the
    /// serve task's handle.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!(
            "{}:{}",
            self.state.settings.server.host, self.state.settings.server.port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "gateway listening");

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(error) = serve.await {
                error!(%error, "server error");
            }
        });
        Ok((local_addr, handle))
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/channels/{channel_id}/events", post(publish_handler))
        .route("/v1/channels/{channel_id}/reopen", post(reopen_handler))
        .route("/v1/presence/{user_id}", get(presence_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket upgrade
// ─────────────────────────────────────────────────────────────────────────────

/// Query parameters accepted by `GET /ws`.
#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    /// Bearer token, for clients that cannot set headers (browsers).
    token: Option<String>,
}

/// Bearer credential from the `Authorization` header, falling back to the
/// `token` query parameter.
fn bearer_token(headers: &HeaderMap, query: &WsQuery) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Some(token) = value.to_str().ok().and_then(|v| v.strip_prefix("Bearer ")) {
            return Some(token.to_owned());
        }
    }
    query.token.clone()
}

/// GET /ws — validates the credential before upgrading, so a bad token
/// costs one HTTP round trip instead of an open-then-closed socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "gateway draining" })),
        )
            .into_response();
    }
    if state.manager.at_capacity() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "code": codes::CONNECTION_LIMIT,
                "message": "instance at connection limit",
            })),
        )
            .into_response();
    }

    let Some(token) = bearer_token(&headers, &query) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": codes::AUTH_FAILED, "message": "missing credential" })),
        )
            .into_response();
    };
    let identity = match state.validator.verify(&token).await {
        Ok(identity) => identity,
        Err(error) => {
            info!(%error, "rejected websocket credential");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "code": codes::AUTH_FAILED, "message": error.to_string() })),
            )
                .into_response();
        }
    };

    ws.max_message_size(state.settings.server.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, identity, state))
}

// ─────────────────────────────────────────────────────────────────────────────
// REST surface
// ─────────────────────────────────────────────────────────────────────────────

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = state.registry.active_sessions().await.unwrap_or(0);
    let resp = health::health_check(
        state.start_time,
        state.manager.count(),
        sessions,
        state.hub.channel_count(),
        state.bridge.state(),
    );
    Json(resp)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}

/// Body of `POST /v1/channels/{channel_id}/events`.
#[derive(Debug, Deserialize)]
struct PublishBody {
    /// Event kind (`delta`, `control`, `presence`).
    kind: EventKind,
    /// Kind-specific payload, forwarded verbatim.
    payload: Value,
}

/// POST /v1/channels/{channel_id}/events — the path model output takes
/// from the inference workers into the stream. Internal: reachable only
/// on the service network, so it carries no credential check.
async fn publish_handler(
    Path(channel_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PublishBody>,
) -> Response {
    let channel_id = ChannelId::from(channel_id);
    match state.hub.publish(&channel_id, body.kind, body.payload).await {
        Ok(sequence) => (StatusCode::OK, Json(json!({ "sequence": sequence }))).into_response(),
        Err(error) => publish_error_response(&error),
    }
}

/// POST /v1/channels/{channel_id}/reopen
async fn reopen_handler(
    Path(channel_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let channel_id = ChannelId::from(channel_id);
    match state.hub.reopen(&channel_id).await {
        Ok(sequence) => (StatusCode::OK, Json(json!({ "sequence": sequence }))).into_response(),
        Err(error) => publish_error_response(&error),
    }
}

fn publish_error_response(error: &PublishError) -> Response {
    let status = match error {
        PublishError::ChannelClosed { .. } | PublishError::LeaseConflict { .. } => {
            StatusCode::CONFLICT
        }
        PublishError::BrokerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(json!({ "code": error.code(), "message": error.to_string() })),
    )
        .into_response()
}

/// GET /v1/presence/{user_id} — the canonical record, regardless of which
/// instance the user's connections live on.
async fn presence_handler(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.tracker.read(&UserId::from(user_id)).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(error) => {
            warn!(%error, "presence read failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "code": codes::BROKER_UNAVAILABLE,
                    "message": error.to_string(),
                })),
            )
                .into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────────────────────────


// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
