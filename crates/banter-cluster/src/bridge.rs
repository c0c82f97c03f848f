//! The [`ClusterBridge`] trait: what the rest of the realtime layer sees
//! of the cluster.
//!
//! A bridge fans events out to every instance (including the publisher,
//! which filters its own origin on receipt) and exposes the shared store
//! through typed helpers layered over [`ClusterBridge::request`]. Two
//! implementations exist: [`MemoryBroker`](crate::MemoryBroker) for
//! single-process deployments and tests, and
//! [`BrokerLink`](crate::BrokerLink) for TCP clusters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use banter_core::InstanceId;
use tokio::sync::watch;

use crate::errors::ClusterError;
use crate::store::{LeaseOutcome, RingSlice, StoreRequest, StoreResponse};

/// A message fanned out to topic subscribers.
#[derive(Debug, Clone)]
pub struct BridgeMessage {
    /// Topic the message was published under.
    pub topic: String,
    /// Instance that published it. Subscribers compare this against
    /// their own ID to skip events they already delivered locally.
    pub origin: InstanceId,
    /// Serialized payload, opaque to the bridge.
    pub payload: String,
}

/// Callback invoked for each inbound message on a subscribed topic.
///
/// Handlers run on the bridge's dispatch path and must not block; hand
/// real work off through a channel.
pub type MessageHandler = Arc<dyn Fn(BridgeMessage) + Send + Sync>;

/// Reachability of the broker as seen by one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// The broker is reachable; fan-out is live.
    Connected,
    /// The broker is unreachable. Local delivery keeps working, but
    /// cross-instance events may be missed until the state returns to
    /// [`BridgeState::Connected`] and subscribers run gap recovery.
    Degraded,
}

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasResult {
    /// Whether the swap was applied.
    pub swapped: bool,
    /// The value now stored under the key.
    pub current: Option<String>,
}

fn unexpected(response: &StoreResponse) -> ClusterError {
    ClusterError::Protocol(format!("unexpected store response: {response:?}"))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Cross-instance pub/sub plus shared store access.
#[async_trait]
pub trait ClusterBridge: Send + Sync {
    /// This instance's cluster identity.
    fn instance_id(&self) -> &InstanceId;

    /// Current broker reachability.
    fn state(&self) -> BridgeState;

    /// A watch that flips on every reachability transition. Subscribers
    /// use the `Degraded` → `Connected` edge to trigger gap recovery.
    fn watch_state(&self) -> watch::Receiver<BridgeState>;

    /// Publishes to every subscriber of `topic` across the cluster,
    /// including this instance.
    async fn publish(&self, topic: &str, payload: String) -> Result<(), ClusterError>;

    /// Registers a handler for `topic`. Re-subscribing replaces the
    /// previous handler. Subscriptions survive broker reconnects.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), ClusterError>;

    /// Drops the handler for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), ClusterError>;

    /// Executes one store request on the broker.
    async fn request(&self, request: StoreRequest) -> Result<StoreResponse, ClusterError>;

    /// Tears the bridge down. Pending requests fail with
    /// [`ClusterError::Closed`].
    async fn shutdown(&self);

    // ─────────────────────────────────────────────────────────────────────
    // Store helpers
    // ─────────────────────────────────────────────────────────────────────

    /// Acquires (or re-enters) a lease on `key` held by this instance.
    async fn acquire_lease(&self, key: &str, ttl: Duration) -> Result<LeaseOutcome, ClusterError> {
        let response = self
            .request(StoreRequest::LeaseAcquire {
                key: key.to_owned(),
                holder: self.instance_id().clone(),
                ttl_ms: ttl_millis(ttl),
            })
            .await?;
        match response {
            StoreResponse::Lease { outcome } => Ok(outcome),
            other => Err(unexpected(&other)),
        }
    }

    /// Extends a lease this instance already holds.
    async fn renew_lease(&self, key: &str, ttl: Duration) -> Result<LeaseOutcome, ClusterError> {
        let response = self
            .request(StoreRequest::LeaseRenew {
                key: key.to_owned(),
                holder: self.instance_id().clone(),
                ttl_ms: ttl_millis(ttl),
            })
            .await?;
        match response {
            StoreResponse::Lease { outcome } => Ok(outcome),
            other => Err(unexpected(&other)),
        }
    }

    /// Releases a lease held by this instance. Returns `false` if it was
    /// already lost.
    async fn release_lease(&self, key: &str) -> Result<bool, ClusterError> {
        let response = self
            .request(StoreRequest::LeaseRelease {
                key: key.to_owned(),
                holder: self.instance_id().clone(),
            })
            .await?;
        match response {
            StoreResponse::Flag { flag } => Ok(flag),
            other => Err(unexpected(&other)),
        }
    }

    /// Writes a value with an optional TTL.
    async fn put_value(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), ClusterError> {
        let response = self
            .request(StoreRequest::Put {
                key: key.to_owned(),
                value: value.to_owned(),
                ttl_ms: ttl.map(ttl_millis),
            })
            .await?;
        match response {
            StoreResponse::Unit => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Reads a value, `None` if absent or expired.
    async fn get_value(&self, key: &str) -> Result<Option<String>, ClusterError> {
        let response = self
            .request(StoreRequest::Get {
                key: key.to_owned(),
            })
            .await?;
        match response {
            StoreResponse::Value { value } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    /// Deletes a key. Returns whether a live value existed.
    async fn remove_value(&self, key: &str) -> Result<bool, ClusterError> {
        let response = self
            .request(StoreRequest::Remove {
                key: key.to_owned(),
            })
            .await?;
        match response {
            StoreResponse::Flag { flag } => Ok(flag),
            other => Err(unexpected(&other)),
        }
    }

    /// Pushes a key's expiry further out. Returns `false` if the key is
    /// gone.
    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, ClusterError> {
        let response = self
            .request(StoreRequest::ExtendTtl {
                key: key.to_owned(),
                ttl_ms: ttl_millis(ttl),
            })
            .await?;
        match response {
            StoreResponse::Flag { flag } => Ok(flag),
            other => Err(unexpected(&other)),
        }
    }

    /// Atomically writes `value` if the current value equals `expect`
    /// (`None` = key must be absent).
    async fn compare_and_swap(
        &self,
        key: &str,
        expect: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<CasResult, ClusterError> {
        let response = self
            .request(StoreRequest::CompareAndSwap {
                key: key.to_owned(),
                expect: expect.map(str::to_owned),
                value: value.to_owned(),
                ttl_ms: ttl.map(ttl_millis),
            })
            .await?;
        match response {
            StoreResponse::Swap { swapped, current } => Ok(CasResult { swapped, current }),
            other => Err(unexpected(&other)),
        }
    }

    /// Counts live keys under a prefix.
    async fn prefix_count(&self, prefix: &str) -> Result<u64, ClusterError> {
        let response = self
            .request(StoreRequest::PrefixCount {
                prefix: prefix.to_owned(),
            })
            .await?;
        match response {
            StoreResponse::Count { count } => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    /// Appends a serialized event to a channel's retention ring.
    async fn ring_append(
        &self,
        channel: &str,
        sequence: u64,
        event: &str,
    ) -> Result<(), ClusterError> {
        let response = self
            .request(StoreRequest::RingAppend {
                channel: channel.to_owned(),
                sequence,
                event: event.to_owned(),
            })
            .await?;
        match response {
            StoreResponse::Unit => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetches retained events with sequence greater than `after`.
    async fn ring_fetch(&self, channel: &str, after: u64) -> Result<RingSlice, ClusterError> {
        let response = self
            .request(StoreRequest::RingFetch {
                channel: channel.to_owned(),
                after,
            })
            .await?;
        match response {
            StoreResponse::Ring { slice } => Ok(slice),
            other => Err(unexpected(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SharedState;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Bridge stub that applies requests straight to a local store, for
    /// exercising the helper defaults without a broker.
    struct StoreOnly {
        instance: InstanceId,
        state: Mutex<SharedState>,
        watch: watch::Sender<BridgeState>,
    }

    impl StoreOnly {
        fn new() -> Self {
            let (watch, _) = watch::channel(BridgeState::Connected);
            Self {
                instance: InstanceId::from("stub"),
                state: Mutex::new(SharedState::new(8)),
                watch,
            }
        }
    }

    #[async_trait]
    impl ClusterBridge for StoreOnly {
        fn instance_id(&self) -> &InstanceId {
            &self.instance
        }

        fn state(&self) -> BridgeState {
            BridgeState::Connected
        }

        fn watch_state(&self) -> watch::Receiver<BridgeState> {
            self.watch.subscribe()
        }

        async fn publish(&self, _topic: &str, _payload: String) -> Result<(), ClusterError> {
            Err(ClusterError::Closed)
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _handler: MessageHandler,
        ) -> Result<(), ClusterError> {
            Err(ClusterError::Closed)
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<(), ClusterError> {
            Err(ClusterError::Closed)
        }

        async fn request(&self, request: StoreRequest) -> Result<StoreResponse, ClusterError> {
            Ok(self.state.lock().apply(request, Instant::now()))
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn lease_helpers_round_trip() {
        let bridge = StoreOnly::new();
        let outcome = bridge
            .acquire_lease("seq-writer/ch", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome, LeaseOutcome::Granted);

        let renewed = bridge
            .renew_lease("seq-writer/ch", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(renewed, LeaseOutcome::Granted);

        assert!(bridge.release_lease("seq-writer/ch").await.unwrap());
        assert!(!bridge.release_lease("seq-writer/ch").await.unwrap());
    }

    #[tokio::test]
    async fn value_helpers_round_trip() {
        let bridge = StoreOnly::new();
        bridge
            .put_value("session/u1", "{\"s\":1}", Some(Duration::from_secs(90)))
            .await
            .unwrap();
        assert_eq!(
            bridge.get_value("session/u1").await.unwrap(),
            Some("{\"s\":1}".to_owned())
        );
        assert!(bridge.extend_ttl("session/u1", Duration::from_secs(90)).await.unwrap());
        assert!(bridge.remove_value("session/u1").await.unwrap());
        assert_eq!(bridge.get_value("session/u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_helper_reports_the_current_value() {
        let bridge = StoreOnly::new();
        let first = bridge
            .compare_and_swap("presence/u1", None, "online", None)
            .await
            .unwrap();
        assert!(first.swapped);

        let second = bridge
            .compare_and_swap("presence/u1", None, "away", None)
            .await
            .unwrap();
        assert!(!second.swapped);
        assert_eq!(second.current, Some("online".to_owned()));
    }

    #[tokio::test]
    async fn ring_helpers_round_trip() {
        let bridge = StoreOnly::new();
        for seq in 1..=4u64 {
            bridge
                .ring_append("ch", seq, &format!("e{seq}"))
                .await
                .unwrap();
        }
        let slice = bridge.ring_fetch("ch", 2).await.unwrap();
        let sequences: Vec<u64> = slice.events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert_eq!(slice.newest, Some(4));
    }

    #[tokio::test]
    async fn prefix_count_helper() {
        let bridge = StoreOnly::new();
        bridge.put_value("conn/s1/a", "{}", None).await.unwrap();
        bridge.put_value("conn/s1/b", "{}", None).await.unwrap();
        bridge.put_value("conn/s2/a", "{}", None).await.unwrap();
        assert_eq!(bridge.prefix_count("conn/s1/").await.unwrap(), 2);
    }
}
