//! WebSocket session lifecycle — one authenticated client from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use banter_core::{ConnectionId, Identity, codes};
use banter_events::ServerFrame;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::handle_frame;
use crate::server::AppState;

/// Close reason recorded when the gateway is draining for restart.
pub const RESTART_REASON: &str = "restarting";

/// How long the outbound pump gets to flush a server-initiated close frame
/// before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// WebSocket close code for a connection's recorded close reason.
fn close_code_for(reason: &str) -> u16 {
    match reason {
        codes::QUEUE_OVERFLOW | codes::CONNECTION_LIMIT => close_code::AGAIN,
        RESTART_REASON => close_code::AWAY,
        _ => close_code::NORMAL,
    }
}

/// Run a WebSocket session for an authenticated client.
///
/// 1. Registers the connection into the identity's session
/// 2. Sends the `connected` frame with the connection and session ids
/// 3. Forwards outbound frames and periodic Ping frames through one pump
/// 4. Dispatches inbound frames; any Pong refreshes the session TTL
/// 5. Cleans up subscriptions, registry state, and metrics on disconnect
#[instrument(skip_all, fields(user = %identity.user_id))]
pub async fn run_ws_session(mut ws: WebSocket, identity: Identity, state: AppState) {
    let connection_id = ConnectionId::new();

    let session_id = match state.registry.register(&identity, &connection_id).await {
        Ok(session_id) => session_id,
        Err(error) => {
            // Without a session the connection has no presence or TTL
            // story; the client retries against a healthy instance.
            warn!(%error, "session registration failed, refusing connection");
            let frame = ServerFrame::status(
                codes::BROKER_UNAVAILABLE,
                "session registration failed, retry shortly",
                None,
            );
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = ws.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(state.settings.server.outbound_queue_depth);
    let connection = Arc::new(ClientConnection::new(
        connection_id.clone(),
        identity,
        session_id.clone(),
        send_tx,
    ));

    if !state.manager.try_add(connection.clone()) {
        info!(connection_id = %connection_id, "connection limit reached, refusing connection");
        let frame = ServerFrame::status(codes::CONNECTION_LIMIT, "instance at connection limit", None);
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = ws.send(Message::Text(json.into())).await;
        }
        let _ = ws
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AGAIN,
                reason: Utf8Bytes::from_static("connection limit"),
            })))
            .await;
        if let Err(error) = state
            .registry
            .disconnect(connection.user_id(), &session_id, &connection_id)
            .await
        {
            debug!(%error, "disconnect after refused connection failed");
        }
        return;
    }

    info!(connection_id = %connection_id, session = %session_id, "client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    let (mut ws_tx, mut ws_rx) = ws.split();

    // First frame on the wire, ahead of anything the pump forwards.
    let connected = ServerFrame::Connected {
        connection_id: connection_id.clone(),
        session_id: session_id.clone(),
    };
    if let Ok(json) = serde_json::to_string(&connected) {
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            let _ = state.manager.remove(&connection_id);
            counter!("ws_disconnections_total").increment(1);
            gauge!("ws_connections_active").decrement(1.0);
            return;
        }
    }

    // Outbound pump: forwards queued frames, pings on the heartbeat
    // interval, and flushes a close frame when the connection is cancelled.
    let pump_conn = connection.clone();
    let ping_every = state.settings.server.heartbeat_interval();
    let pong_deadline = state.settings.server.heartbeat_timeout();
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;
        let pump_closed = pump_conn.closed();

        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if !pump_conn.check_alive()
                        && pump_conn.last_pong_elapsed() > pong_deadline
                    {
                        warn!("client unresponsive for {:?}, disconnecting", pong_deadline);
                        pump_conn.close("unresponsive");
                        break;
                    }
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                () = pump_closed.cancelled() => {
                    let reason = pump_conn.close_reason().unwrap_or("closed");
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code_for(reason),
                            reason: Utf8Bytes::from_static(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Inbound loop: dispatch frames until the peer goes away, the
    // connection is closed server-side, or the gateway drains.
    let shutdown = state.shutdown.token();
    let conn_closed = connection.closed();
    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            () = conn_closed.cancelled() => break,
            () = shutdown.cancelled() => {
                connection.close(RESTART_REASON);
                break;
            }
        };
        let Some(Ok(message)) = message else { break };
        // Any inbound frame proves the client is there.
        connection.mark_alive();

        let text = match message {
            Message::Text(ref t) => Some(t.to_string()),
            Message::Binary(ref data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    Some(s.to_string())
                } else {
                    debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                    None
                }
            }
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
            Message::Ping(_) => None,
            Message::Pong(_) => {
                // Session TTL refresh rides the ping cadence, so idle but
                // live clients never lapse.
                if let Err(error) = state
                    .registry
                    .heartbeat(connection.user_id(), &session_id, &connection_id)
                    .await
                {
                    debug!(%error, "heartbeat refresh failed");
                }
                None
            }
        };

        let Some(text) = text else { continue };
        handle_frame(&text, &connection, &state).await;
    }

    // Clean up
    info!(connection_id = %connection_id, dropped = connection.drop_count(), "client disconnected");
    state.hub.unsubscribe_all(&connection_id);
    if let Err(error) = state
        .registry
        .disconnect(connection.user_id(), &session_id, &connection_id)
        .await
    {
        debug!(%error, "registry disconnect failed");
    }
    let _ = state.manager.remove(&connection_id);
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection.age().as_secs_f64());

    if connection.is_closed() {
        // Server-initiated close: give the pump a beat to flush the close
        // frame before stopping it.
        if tokio::time::timeout(CLOSE_GRACE, &mut outbound).await.is_err() {
            outbound.abort();
        }
    } else {
        outbound.abort();
    }
}
