//! Connection registry with capacity enforcement.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use banter_core::codes;
use banter_core::{ConnectionId, UserId};
use banter_events::ServerFrame;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::connection::ClientConnection;

/// Tracks every live connection on this instance.
///
/// The separate atomic count lets `try_add` reserve a slot before touching
/// the map, so concurrent upgrades cannot overshoot the connection limit.
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    count: AtomicUsize,
    limit: usize,
}

impl ConnectionManager {
    /// Create a manager that refuses connections beyond `limit`.
    pub fn new(limit: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            count: AtomicUsize::new(0),
            limit,
        }
    }

    /// Register a connection, enforcing the connection limit.
    ///
    /// Returns `false` when the instance is full; the caller closes the
    /// socket with `CONNECTION_LIMIT`.
    pub fn try_add(&self, connection: Arc<ClientConnection>) -> bool {
        let reserved = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current >= self.limit {
                    None
                } else {
                    Some(current + 1)
                }
            });
        if reserved.is_err() {
            return false;
        }

        let _ = self
            .by_user
            .entry(connection.user_id().clone())
            .or_default()
            .insert(connection.id.clone());
        let _ = self.connections.insert(connection.id.clone(), connection);
        true
    }

    /// Remove a connection, releasing its slot.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let (_, connection) = self.connections.remove(id)?;
        let _ = self.count.fetch_sub(1, Ordering::AcqRel);
        if let Entry::Occupied(mut owned) = self.by_user.entry(connection.user_id().clone()) {
            let _ = owned.get_mut().remove(id);
            if owned.get().is_empty() {
                let _ = owned.remove();
            }
        }
        Some(connection)
    }

    /// Look up a connection by ID.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the instance is at its connection limit.
    pub fn at_capacity(&self) -> bool {
        self.count() >= self.limit
    }

    /// All live connections belonging to a user on this instance.
    pub fn connections_of_user(&self, user_id: &UserId) -> Vec<Arc<ClientConnection>> {
        let Some(ids) = self.by_user.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|entry| entry.value().clone()))
            .collect()
    }

    /// Tear down one connection with a status frame and close reason.
    ///
    /// The status frame is best effort: a connection being evicted for
    /// queue overflow has no queue space left for it, so the close frame
    /// reason carries the code instead.
    pub fn close(&self, id: &ConnectionId, code: &'static str, message: &str) {
        if let Some(connection) = self.get(id) {
            let _ = connection.send_frame(&ServerFrame::status(code, message, None));
            connection.close(code);
            debug!(connection_id = %id, code, "connection close requested");
        }
    }

    /// Tear down every connection, for gateway shutdown.
    pub fn close_all(&self, code: &'static str, message: &str) {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!(connections = ids.len(), "closing all connections");
        for id in ids {
            self.close(&id, code, message);
        }
    }
}

/// Close connections the channel hub evicted for outbound queue overflow.
///
/// Runs until the hub drops its eviction sender.
pub fn watch_evictions(
    manager: Arc<ConnectionManager>,
    mut evicted: mpsc::UnboundedReceiver<ConnectionId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(id) = evicted.recv().await {
            info!(connection_id = %id, "closing connection after queue overflow");
            manager.close(&id, codes::QUEUE_OVERFLOW, "outbound queue overflowed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_core::{Identity, SessionId};

    fn make_connection(
        id: &str,
        user: &str,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(
            ConnectionId::from(id),
            Identity::new(user, vec![]),
            SessionId::from("sess-1"),
            tx,
        );
        (Arc::new(conn), rx)
    }

    #[test]
    fn add_and_count() {
        let manager = ConnectionManager::new(8);
        let (conn, _rx) = make_connection("c1", "u1");
        assert!(manager.try_add(conn));
        assert_eq!(manager.count(), 1);
        assert!(manager.get(&ConnectionId::from("c1")).is_some());
    }

    #[test]
    fn remove_releases_slot() {
        let manager = ConnectionManager::new(1);
        let (conn, _rx) = make_connection("c1", "u1");
        assert!(manager.try_add(conn));
        assert!(manager.at_capacity());

        let removed = manager.remove(&ConnectionId::from("c1"));
        assert!(removed.is_some());
        assert_eq!(manager.count(), 0);
        assert!(!manager.at_capacity());
    }

    #[test]
    fn limit_enforced() {
        let manager = ConnectionManager::new(2);
        let (c1, _rx1) = make_connection("c1", "u1");
        let (c2, _rx2) = make_connection("c2", "u1");
        let (c3, _rx3) = make_connection("c3", "u2");
        assert!(manager.try_add(c1));
        assert!(manager.try_add(c2));
        assert!(!manager.try_add(c3));
        assert_eq!(manager.count(), 2);
    }

    #[test]
    fn remove_unknown_is_none() {
        let manager = ConnectionManager::new(8);
        assert!(manager.remove(&ConnectionId::from("ghost")).is_none());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn user_index_tracks_connections() {
        let manager = ConnectionManager::new(8);
        let (c1, _rx1) = make_connection("c1", "alice");
        let (c2, _rx2) = make_connection("c2", "alice");
        let (c3, _rx3) = make_connection("c3", "bob");
        assert!(manager.try_add(c1));
        assert!(manager.try_add(c2));
        assert!(manager.try_add(c3));

        let alice = manager.connections_of_user(&UserId::from("alice"));
        assert_eq!(alice.len(), 2);
        let bob = manager.connections_of_user(&UserId::from("bob"));
        assert_eq!(bob.len(), 1);
        assert!(manager.connections_of_user(&UserId::from("carol")).is_empty());
    }

    #[test]
    fn user_index_cleaned_on_remove() {
        let manager = ConnectionManager::new(8);
        let (c1, _rx1) = make_connection("c1", "alice");
        assert!(manager.try_add(c1));
        let _ = manager.remove(&ConnectionId::from("c1"));
        assert!(manager.connections_of_user(&UserId::from("alice")).is_empty());
    }

    #[tokio::test]
    async fn close_sends_status_and_cancels() {
        let manager = ConnectionManager::new(8);
        let (conn, mut rx) = make_connection("c1", "u1");
        assert!(manager.try_add(conn.clone()));

        manager.close(&conn.id, codes::CONNECTION_LIMIT, "instance full");

        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(codes::CONNECTION_LIMIT));
        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "status");
        assert_eq!(parsed["code"], codes::CONNECTION_LIMIT);
    }

    #[test]
    fn close_all_cancels_everything() {
        let manager = ConnectionManager::new(8);
        let (c1, _rx1) = make_connection("c1", "u1");
        let (c2, _rx2) = make_connection("c2", "u2");
        assert!(manager.try_add(c1.clone()));
        assert!(manager.try_add(c2.clone()));

        manager.close_all(codes::INTERNAL_ERROR, "shutting down");

        assert!(c1.is_closed());
        assert!(c2.is_closed());
    }

    #[tokio::test]
    async fn eviction_watcher_closes_connection() {
        let manager = Arc::new(ConnectionManager::new(8));
        let (conn, _rx) = make_connection("c1", "u1");
        assert!(manager.try_add(conn.clone()));

        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let watcher = watch_evictions(manager.clone(), evict_rx);

        evict_tx.send(conn.id.clone()).unwrap();
        conn.closed().cancelled().await;
        assert_eq!(conn.close_reason(), Some(codes::QUEUE_OVERFLOW));

        drop(evict_tx);
        watcher.await.unwrap();
    }
}
