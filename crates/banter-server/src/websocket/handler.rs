//! Client frame dispatch — parses incoming text as a `ClientFrame` and
//! routes it to the hub, registry, or presence tracker.
//!
//! Errors never close the connection here. Everything the client did wrong
//! comes back as a `status` frame; only queue overflow and liveness
//! timeouts (handled in the session) tear a connection down.

use std::sync::Arc;

use banter_core::codes;
use banter_core::{ChannelId, PublishError};
use banter_events::{ClientFrame, EventKind, PresenceRecord, PresenceStatus, ServerFrame};
use tracing::{debug, instrument, warn};

use super::connection::ClientConnection;
use crate::server::AppState;

/// Handle one inbound text frame from a connected client.
#[instrument(skip_all, fields(connection_id = %connection.id))]
pub async fn handle_frame(text: &str, connection: &Arc<ClientConnection>, state: &AppState) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(%error, "unparseable client frame");
            let _ = connection.send_frame(&ServerFrame::status(
                codes::INVALID_FRAME,
                format!("unparseable frame: {error}"),
                None,
            ));
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe {
            channel_id,
            last_seen,
        } => subscribe(connection, state, channel_id, last_seen).await,
        ClientFrame::Unsubscribe { channel_id } => {
            debug!(channel_id = %channel_id, "unsubscribe");
            state.hub.unsubscribe(&channel_id, &connection.id);
        }
        ClientFrame::Heartbeat => {
            if let Err(error) = state
                .registry
                .heartbeat(connection.user_id(), &connection.session_id, &connection.id)
                .await
            {
                debug!(%error, "heartbeat refresh failed");
            }
        }
        ClientFrame::Presence { channel_id, status } => {
            presence_update(connection, state, channel_id, status).await;
        }
    }
}

/// Authorize, attach, and acknowledge a subscription.
///
/// The ack is enqueued after the hub returns, which is after any replay was
/// enqueued; the client therefore sees replayed events first and can treat
/// `replayedTo` in the ack as exact.
async fn subscribe(
    connection: &Arc<ClientConnection>,
    state: &AppState,
    channel_id: ChannelId,
    last_seen: Option<u64>,
) {
    if !state
        .authorizer
        .may_subscribe(&connection.identity, &channel_id)
    {
        warn!(channel_id = %channel_id, user_id = %connection.user_id(), "subscribe refused");
        let _ = connection.send_frame(&ServerFrame::status(
            codes::UNAUTHORIZED_CHANNEL,
            "not authorized for this channel",
            Some(channel_id),
        ));
        return;
    }

    match state
        .hub
        .subscribe(&channel_id, &connection.id, connection.sender(), last_seen)
        .await
    {
        Ok(replayed_to) => {
            debug!(channel_id = %channel_id, ?replayed_to, "subscribed");
            let _ = connection.send_frame(&ServerFrame::Subscribed {
                channel_id,
                replayed_to,
            });
        }
        Err(error) => {
            warn!(channel_id = %channel_id, %error, "subscribe failed");
            let _ = connection.send_frame(&ServerFrame::status(
                error.code(),
                error.to_string(),
                Some(channel_id),
            ));
        }
    }
}

/// Apply a presence change from the client.
///
/// The canonical record always goes through the tracker. Typing is
/// channel-scoped and additionally published straight into the named
/// channel; online/away transitions reach channels through the presence
/// bridge so repeated frames do not duplicate events.
async fn presence_update(
    connection: &Arc<ClientConnection>,
    state: &AppState,
    channel_id: ChannelId,
    status: PresenceStatus,
) {
    if let Err(error) = state
        .tracker
        .set_status(connection.user_id(), status)
        .await
    {
        debug!(%error, "presence update failed");
    }

    if status != PresenceStatus::Typing {
        return;
    }

    let record = PresenceRecord::now(connection.user_id().clone(), status);
    let payload = match serde_json::to_value(&record) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, "presence record serialization failed");
            return;
        }
    };
    match state
        .hub
        .publish(&channel_id, EventKind::Presence, payload)
        .await
    {
        Ok(_) => {}
        Err(PublishError::LeaseConflict { holder, .. }) => {
            // Another instance is streaming this channel right now; the
            // typing hint is soft state, so it is dropped rather than
            // forwarded.
            debug!(channel_id = %channel_id, %holder, "typing update dropped, lease held elsewhere");
        }
        Err(error) => {
            debug!(channel_id = %channel_id, %error, "typing update dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::make_state;
    use banter_core::{ConnectionId, Identity, SessionId};
    use serde_json::Value;
    use tokio::sync::mpsc;

    async fn make_connection(
        state: &AppState,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let identity = Identity::new("user-1", vec![]);
        let connection_id = ConnectionId::new();
        let session_id = state
            .registry
            .register(&identity, &connection_id)
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(32);
        let conn = Arc::new(ClientConnection::new(connection_id, identity, session_id, tx));
        (conn, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        let raw = rx.recv().await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn invalid_json_yields_status_frame() {
        let state = make_state().await;
        let (conn, mut rx) = make_connection(&state).await;

        handle_frame("not json", &conn, &state).await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["type"], "status");
        assert_eq!(frame["code"], codes::INVALID_FRAME);
    }

    #[tokio::test]
    async fn subscribe_acks_with_no_replay() {
        let state = make_state().await;
        let (conn, mut rx) = make_connection(&state).await;

        handle_frame(r#"{"type":"subscribe","channelId":"chan-1"}"#, &conn, &state).await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["type"], "subscribed");
        assert_eq!(frame["channelId"], "chan-1");
        assert!(frame.get("replayedTo").is_none());
    }

    #[tokio::test]
    async fn replayed_events_precede_the_ack() {
        let state = make_state().await;
        let channel = ChannelId::from("chan-replay");
        for i in 0..4 {
            let _ = state
                .hub
                .publish(&channel, EventKind::Delta, serde_json::json!({"i": i}))
                .await
                .unwrap();
        }

        let (conn, mut rx) = make_connection(&state).await;
        handle_frame(
            r#"{"type":"subscribe","channelId":"chan-replay","lastSeen":1}"#,
            &conn,
            &state,
        )
        .await;

        // Events 2..=4 replay first, then the ack reports the high-water mark.
        for expected in 2..=4u64 {
            let frame = next_frame(&mut rx).await;
            assert_eq!(frame["type"], "event", "expected event before ack");
            assert_eq!(frame["sequence"], expected);
        }
        let ack = next_frame(&mut rx).await;
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["replayedTo"], 4);
    }

    #[tokio::test]
    async fn unauthorized_subscribe_gets_status_not_ack() {
        let state = make_state().await;
        let (conn, mut rx) = make_connection(&state).await;

        handle_frame(
            r#"{"type":"subscribe","channelId":"ops:secret"}"#,
            &conn,
            &state,
        )
        .await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["type"], "status");
        assert_eq!(frame["code"], codes::UNAUTHORIZED_CHANNEL);
        assert_eq!(frame["channelId"], "ops:secret");
    }

    #[tokio::test]
    async fn stale_resume_gets_resync_required() {
        let state = make_state().await;
        let channel = ChannelId::from("chan-deep");
        // Push the ring past its capacity so sequence 1 falls out of retention.
        for i in 0..40u64 {
            let _ = state
                .hub
                .publish(&channel, EventKind::Delta, serde_json::json!({"i": i}))
                .await
                .unwrap();
        }

        let (conn, mut rx) = make_connection(&state).await;
        handle_frame(
            r#"{"type":"subscribe","channelId":"chan-deep","lastSeen":1}"#,
            &conn,
            &state,
        )
        .await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["type"], "status");
        assert_eq!(frame["code"], codes::RESYNC_REQUIRED);
    }

    #[tokio::test]
    async fn unsubscribe_is_silent() {
        let state = make_state().await;
        let (conn, mut rx) = make_connection(&state).await;

        handle_frame(r#"{"type":"subscribe","channelId":"chan-1"}"#, &conn, &state).await;
        let _ = next_frame(&mut rx).await;

        handle_frame(r#"{"type":"unsubscribe","channelId":"chan-1"}"#, &conn, &state).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(state.hub.subscriber_count(&ChannelId::from("chan-1")), 0);
    }

    #[tokio::test]
    async fn heartbeat_produces_no_frame() {
        let state = make_state().await;
        let (conn, mut rx) = make_connection(&state).await;

        handle_frame(r#"{"type":"heartbeat"}"#, &conn, &state).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_publishes_into_named_channel() {
        let state = make_state().await;
        let (conn, mut rx) = make_connection(&state).await;
        let (peer, mut peer_rx) = make_connection(&state).await;

        // Peer subscribed to the channel sees the typing event.
        handle_frame(r#"{"type":"subscribe","channelId":"chan-t"}"#, &peer, &state).await;
        let _ = next_frame(&mut peer_rx).await;

        handle_frame(
            r#"{"type":"presence","channelId":"chan-t","status":"typing"}"#,
            &conn,
            &state,
        )
        .await;

        let frame = next_frame(&mut peer_rx).await;
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["kind"], "presence");
        assert_eq!(frame["payload"]["userId"], "user-1");
        assert_eq!(frame["payload"]["status"], "typing");

        // The sender gets no echo on a channel it is not subscribed to.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn online_presence_does_not_publish_directly() {
        let state = make_state().await;
        let (conn, _rx) = make_connection(&state).await;
        let (peer, mut peer_rx) = make_connection(&state).await;

        handle_frame(r#"{"type":"subscribe","channelId":"chan-t"}"#, &peer, &state).await;
        let _ = next_frame(&mut peer_rx).await;

        // Routed through the presence bridge instead, which is not running
        // in this test, so nothing arrives in-channel.
        handle_frame(
            r#"{"type":"presence","channelId":"chan-t","status":"away"}"#,
            &conn,
            &state,
        )
        .await;
        assert!(peer_rx.try_recv().is_err());

        // The canonical record did change.
        let record = state
            .tracker
            .read(conn.user_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, PresenceStatus::Away);
    }
}
