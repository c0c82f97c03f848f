//! In-process broker for single-instance deployments and tests.
//!
//! All bridges handed out by one [`MemoryBroker`] share a store and a
//! topic table, so a multi-instance cluster can be simulated inside one
//! process. [`MemoryBroker::partition`] severs one bridge to exercise
//! degraded-mode behavior: its operations fail, fan-out skips it, and
//! its state watch flips, exactly as a dropped TCP link would.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use banter_core::InstanceId;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::bridge::{BridgeMessage, BridgeState, ClusterBridge, MessageHandler};
use crate::errors::ClusterError;
use crate::store::{SharedState, StoreRequest, StoreResponse};

/// Shared in-process broker.
pub struct MemoryBroker {
    state: Mutex<SharedState>,
    /// topic → instance → handler.
    topics: DashMap<String, HashMap<String, MessageHandler>>,
    /// instance → reachability watch, shared with the bridge.
    bridges: DashMap<String, Arc<watch::Sender<BridgeState>>>,
}

impl MemoryBroker {
    /// Creates a broker whose retention rings keep `ring_capacity`
    /// events per channel.
    pub fn new(ring_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SharedState::new(ring_capacity)),
            topics: DashMap::new(),
            bridges: DashMap::new(),
        })
    }

    /// Hands out a bridge for one instance.
    pub fn bridge(self: &Arc<Self>, instance: InstanceId) -> Arc<MemoryBridge> {
        let (tx, _) = watch::channel(BridgeState::Connected);
        let tx = Arc::new(tx);
        let _ = self
            .bridges
            .insert(instance.as_str().to_owned(), Arc::clone(&tx));
        Arc::new(MemoryBridge {
            broker: Arc::clone(self),
            instance,
            state_tx: tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Severs one instance from the broker: its publishes and requests
    /// fail, and fan-out no longer reaches it.
    pub fn partition(&self, instance: &InstanceId) {
        if let Some(tx) = self.bridges.get(instance.as_str()) {
            let _ = tx.send(BridgeState::Degraded);
            debug!(instance = %instance, "memory broker partitioned instance");
        }
    }

    /// Restores a severed instance. Its state watch flips back to
    /// [`BridgeState::Connected`], which subscribers use to trigger gap
    /// recovery.
    pub fn heal(&self, instance: &InstanceId) {
        if let Some(tx) = self.bridges.get(instance.as_str()) {
            let _ = tx.send(BridgeState::Connected);
            debug!(instance = %instance, "memory broker healed instance");
        }
    }

    /// Drops expired keys and leases.
    pub fn purge_expired(&self) {
        self.state.lock().purge_expired(Instant::now());
    }

    fn instance_state(&self, instance: &InstanceId) -> BridgeState {
        self.bridges
            .get(instance.as_str())
            .map_or(BridgeState::Degraded, |tx| *tx.borrow())
    }

    fn fan_out(&self, topic: &str, origin: &InstanceId, payload: String) {
        // Clone the handlers out of the map before invoking them, so a
        // handler that subscribes or publishes cannot deadlock the table.
        let handlers: Vec<(String, MessageHandler)> = match self.topics.get(topic) {
            Some(entry) => entry
                .iter()
                .map(|(instance, handler)| (instance.clone(), Arc::clone(handler)))
                .collect(),
            None => return,
        };
        for (instance, handler) in handlers {
            let reachable = self
                .bridges
                .get(&instance)
                .is_some_and(|tx| *tx.borrow() == BridgeState::Connected);
            if !reachable {
                continue;
            }
            handler(BridgeMessage {
                topic: topic.to_owned(),
                origin: origin.clone(),
                payload: payload.clone(),
            });
        }
    }
}

/// One instance's handle onto a [`MemoryBroker`].
pub struct MemoryBridge {
    broker: Arc<MemoryBroker>,
    instance: InstanceId,
    state_tx: Arc<watch::Sender<BridgeState>>,
    closed: AtomicBool,
}

impl MemoryBridge {
    fn ensure_open(&self) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        Ok(())
    }

    fn ensure_reachable(&self) -> Result<(), ClusterError> {
        self.ensure_open()?;
        match *self.state_tx.borrow() {
            BridgeState::Connected => Ok(()),
            BridgeState::Degraded => Err(ClusterError::BrokerUnavailable),
        }
    }
}

#[async_trait]
impl ClusterBridge for MemoryBridge {
    fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    fn state(&self) -> BridgeState {
        if self.closed.load(Ordering::Acquire) {
            return BridgeState::Degraded;
        }
        self.broker.instance_state(&self.instance)
    }

    fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), ClusterError> {
        self.ensure_reachable()?;
        self.broker.fan_out(topic, &self.instance, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), ClusterError> {
        self.ensure_open()?;
        let mut entry = self.broker.topics.entry(topic.to_owned()).or_default();
        let _ = entry.insert(self.instance.as_str().to_owned(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClusterError> {
        self.ensure_open()?;
        if let Some(mut entry) = self.broker.topics.get_mut(topic) {
            let _ = entry.remove(self.instance.as_str());
        }
        Ok(())
    }

    async fn request(&self, request: StoreRequest) -> Result<StoreResponse, ClusterError> {
        self.ensure_reachable()?;
        Ok(self.broker.state.lock().apply(request, Instant::now()))
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.state_tx.send(BridgeState::Degraded);
        let _ = self.broker.bridges.remove(self.instance.as_str());
        for mut entry in self.broker.topics.iter_mut() {
            let _ = entry.remove(self.instance.as_str());
        }
        debug!(instance = %self.instance, "memory bridge shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LeaseOutcome;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collector() -> (MessageHandler, mpsc::UnboundedReceiver<BridgeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |message| {
            let _ = tx.send(message);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber_including_the_publisher() {
        let broker = MemoryBroker::new(16);
        let a = broker.bridge(InstanceId::from("a"));
        let b = broker.bridge(InstanceId::from("b"));

        let (handler_a, mut rx_a) = collector();
        let (handler_b, mut rx_b) = collector();
        a.subscribe("events/ch", handler_a).await.unwrap();
        b.subscribe("events/ch", handler_b).await.unwrap();

        a.publish("events/ch", "hello".into()).await.unwrap();

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.payload, "hello");
        assert_eq!(got_a.origin.as_str(), "a");
        assert_eq!(got_b.payload, "hello");
        assert_eq!(got_b.topic, "events/ch");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new(16);
        let a = broker.bridge(InstanceId::from("a"));
        let b = broker.bridge(InstanceId::from("b"));

        let (handler, mut rx) = collector();
        b.subscribe("events/ch", handler).await.unwrap();
        b.unsubscribe("events/ch").await.unwrap();

        a.publish("events/ch", "dropped".into()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribe_replaces_the_previous_handler() {
        let broker = MemoryBroker::new(16);
        let a = broker.bridge(InstanceId::from("a"));

        let (old_handler, mut old_rx) = collector();
        let (new_handler, mut new_rx) = collector();
        a.subscribe("t", old_handler).await.unwrap();
        a.subscribe("t", new_handler).await.unwrap();

        a.publish("t", "x".into()).await.unwrap();
        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.recv().await.unwrap().payload, "x");
    }

    #[tokio::test]
    async fn partitioned_bridge_fails_fast_and_misses_fan_out() {
        let broker = MemoryBroker::new(16);
        let a = broker.bridge(InstanceId::from("a"));
        let b = broker.bridge(InstanceId::from("b"));

        let (handler_a, mut rx_a) = collector();
        a.subscribe("t", handler_a).await.unwrap();

        let mut state_watch = a.watch_state();
        broker.partition(a.instance_id());
        state_watch.changed().await.unwrap();
        assert_eq!(*state_watch.borrow(), BridgeState::Degraded);
        assert_eq!(a.state(), BridgeState::Degraded);

        assert_matches!(
            a.publish("t", "x".into()).await,
            Err(ClusterError::BrokerUnavailable)
        );
        assert_matches!(
            a.get_value("k").await,
            Err(ClusterError::BrokerUnavailable)
        );

        // Fan-out from a healthy instance skips the partitioned one.
        b.publish("t", "missed".into()).await.unwrap();
        assert!(rx_a.try_recv().is_err());

        broker.heal(a.instance_id());
        state_watch.changed().await.unwrap();
        assert_eq!(*state_watch.borrow(), BridgeState::Connected);

        b.publish("t", "after-heal".into()).await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap().payload, "after-heal");
    }

    #[tokio::test]
    async fn bridges_share_one_store() {
        let broker = MemoryBroker::new(16);
        let a = broker.bridge(InstanceId::from("a"));
        let b = broker.bridge(InstanceId::from("b"));

        a.put_value("session/u1", "{}", None).await.unwrap();
        assert_eq!(b.get_value("session/u1").await.unwrap(), Some("{}".into()));
    }

    #[tokio::test]
    async fn leases_are_contended_across_bridges() {
        let broker = MemoryBroker::new(16);
        let a = broker.bridge(InstanceId::from("a"));
        let b = broker.bridge(InstanceId::from("b"));

        let first = a
            .acquire_lease("seq-writer/ch", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(first, LeaseOutcome::Granted);

        let second = b
            .acquire_lease("seq-writer/ch", Duration::from_secs(10))
            .await
            .unwrap();
        assert_matches!(second, LeaseOutcome::Held { holder } if holder.as_str() == "a");
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_under_the_paused_clock() {
        let broker = MemoryBroker::new(16);
        let a = broker.bridge(InstanceId::from("a"));

        a.put_value("session/u1", "{}", Some(Duration::from_secs(90)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(a.get_value("session/u1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(a.get_value("session/u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_closes_the_bridge() {
        let broker = MemoryBroker::new(16);
        let a = broker.bridge(InstanceId::from("a"));
        let b = broker.bridge(InstanceId::from("b"));

        let (handler, mut rx) = collector();
        a.subscribe("t", handler).await.unwrap();
        a.shutdown().await;

        assert_matches!(a.publish("t", "x".into()).await, Err(ClusterError::Closed));
        assert_eq!(a.state(), BridgeState::Degraded);

        // Fan-out no longer reaches the closed bridge.
        b.publish("t", "x".into()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
