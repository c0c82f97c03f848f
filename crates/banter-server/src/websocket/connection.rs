//! Per-client WebSocket connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use banter_core::{ConnectionId, Identity, SessionId, UserId};
use banter_events::ServerFrame;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connected, authenticated WebSocket client.
///
/// Identity and session are fixed at construction; authentication happens
/// before the upgrade completes, so an unauthenticated connection never
/// exists in this form.
pub struct ClientConnection {
    /// Unique connection ID, minted at upgrade.
    pub id: ConnectionId,
    /// Verified identity of the client.
    pub identity: Identity,
    /// Session this connection belongs to.
    pub session_id: SessionId,
    /// Bounded queue feeding the socket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Cancelled to tear the connection down from anywhere.
    cancel: CancellationToken,
    /// First close reason wins; later calls keep it.
    close_reason: Mutex<Option<&'static str>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded since the last ping cycle.
    pub is_alive: AtomicBool,
    /// When the last Pong (or any inbound frame) was received.
    last_pong: Mutex<Instant>,
    /// Frames dropped because the outbound queue was full.
    pub dropped_frames: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        session_id: SessionId,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            session_id,
            tx,
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// The user this connection authenticated as.
    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    /// Clone of the outbound queue sender, for handing to the channel hub.
    pub fn sender(&self) -> mpsc::Sender<Arc<String>> {
        self.tx.clone()
    }

    /// Serialize a server frame and enqueue it.
    ///
    /// Returns `false` if the frame could not be enqueued.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.send_raw(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Enqueue an already-serialized frame.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped frame counter.
    pub fn send_raw(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Request this connection be torn down.
    ///
    /// The session task observes the token and closes the socket with the
    /// stored reason. The first reason sticks.
    pub fn close(&self, reason: &'static str) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    /// Token that resolves once `close` has been called.
    pub fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The reason recorded by the first `close` call.
    pub fn close_reason(&self) -> Option<&'static str> {
        *self.close_reason.lock()
    }

    /// Mark the connection as alive (pong or inbound frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for the ping cycle.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_core::codes;

    fn make_connection() -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        let identity = Identity::new("user-1", vec![]);
        let conn = ClientConnection::new(
            ConnectionId::from("conn-1"),
            identity,
            SessionId::from("sess-1"),
            tx,
        );
        (conn, rx)
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.id.as_str(), "conn-1");
        assert_eq!(conn.user_id().as_str(), "user-1");
        assert_eq!(conn.session_id.as_str(), "sess-1");
        assert!(conn.is_alive.load(Ordering::Relaxed));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn send_raw_success() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send_raw(Arc::new("hello".into())));
        let frame = rx.recv().await.unwrap();
        assert_eq!(&*frame, "hello");
    }

    #[tokio::test]
    async fn send_to_closed_queue_returns_false() {
        let (conn, rx) = make_connection();
        drop(rx);
        assert!(!conn.send_raw(Arc::new("hello".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_to_full_queue_counts_drop() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new(
            ConnectionId::from("conn-2"),
            Identity::new("user-1", vec![]),
            SessionId::from("sess-1"),
            tx,
        );
        assert!(conn.send_raw(Arc::new("first".into())));
        assert!(!conn.send_raw(Arc::new("second".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_frame_serializes() {
        let (conn, mut rx) = make_connection();
        let frame = ServerFrame::status(codes::INVALID_FRAME, "bad frame", None);
        assert!(conn.send_frame(&frame));
        let json = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "status");
        assert_eq!(parsed["code"], codes::INVALID_FRAME);
    }

    #[test]
    fn first_close_reason_wins() {
        let (conn, _rx) = make_connection();
        conn.close(codes::QUEUE_OVERFLOW);
        conn.close(codes::CONNECTION_LIMIT);
        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(codes::QUEUE_OVERFLOW));
    }

    #[tokio::test]
    async fn closed_token_resolves() {
        let (conn, _rx) = make_connection();
        let token = conn.closed();
        conn.close(codes::QUEUE_OVERFLOW);
        token.cancelled().await;
    }

    #[test]
    fn mark_alive_and_check() {
        let (conn, _rx) = make_connection();
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn connection_age_increases() {
        let (conn, _rx) = make_connection();
        let first = conn.age();
        std::thread::sleep(Duration::from_millis(10));
        assert!(conn.age() > first);
    }

    #[tokio::test]
    async fn sender_feeds_same_queue() {
        let (conn, mut rx) = make_connection();
        let hub_side = conn.sender();
        hub_side.try_send(Arc::new("from hub".into())).unwrap();
        assert!(conn.send_raw(Arc::new("from server".into())));
        assert_eq!(&*rx.recv().await.unwrap(), "from hub");
        assert_eq!(&*rx.recv().await.unwrap(), "from server");
    }
}
