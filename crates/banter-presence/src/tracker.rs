//! Presence state machine over the shared store.
//!
//! Canonical presence lives under `presence/{user_id}` in the cluster
//! store, never only in process memory. Every transition goes through
//! compare-and-swap so concurrent writers (another device, a peer
//! instance's sweep) settle on one winner, and only the winner emits the
//! change event. Typing is last-writer-wins and decays back to online
//! after a short TTL; the decay is also a CAS, armed with the exact JSON
//! that was written, so a newer write cancels it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use banter_cluster::ClusterBridge;
use banter_core::UserId;
use banter_events::{PresenceRecord, PresenceStatus};
use banter_settings::PresenceSettings;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::RegistryError;
use crate::records::presence_key;

const PRESENCE_QUEUE: usize = 256;

struct DecayOrder {
    user_id: UserId,
    /// The exact stored JSON at arm time; decay fires only if it is
    /// still current.
    armed: String,
    deadline: Instant,
}

/// Tracks and transitions per-user presence.
pub struct PresenceTracker {
    bridge: Arc<dyn ClusterBridge>,
    settings: PresenceSettings,
    changes: mpsc::Sender<PresenceRecord>,
    decay: mpsc::UnboundedSender<DecayOrder>,
}

impl PresenceTracker {
    /// Creates a tracker and the receiver its change events arrive on.
    /// The caller routes those events into the channels the user's
    /// session participates in.
    pub fn new(
        bridge: Arc<dyn ClusterBridge>,
        settings: PresenceSettings,
    ) -> (Arc<Self>, mpsc::Receiver<PresenceRecord>) {
        let (changes_tx, changes_rx) = mpsc::channel(PRESENCE_QUEUE);
        let (decay_tx, decay_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Self {
            bridge,
            settings,
            changes: changes_tx,
            decay: decay_tx,
        });
        let _ = tokio::spawn(decay_worker(Arc::downgrade(&tracker), decay_rx));
        (tracker, changes_rx)
    }

    /// Reads a user's presence, reporting stale typing as online.
    pub async fn read(&self, user_id: &UserId) -> Result<Option<PresenceRecord>, RegistryError> {
        Ok(self
            .read_raw(user_id)
            .await?
            .map(|(_, record)| self.normalize(record)))
    }

    /// Transitions to online if the user was away, offline, or absent;
    /// otherwise just refreshes the record's TTL.
    pub async fn mark_online(&self, user_id: &UserId) -> Result<(), RegistryError> {
        let key = presence_key(user_id);
        match self.read_raw(user_id).await? {
            Some((_, record)) if record.status.is_live() => {
                let _ = self
                    .bridge
                    .extend_ttl(&key, self.settings.session_ttl())
                    .await?;
            }
            Some((current, _)) => {
                let next = PresenceRecord::now(user_id.clone(), PresenceStatus::Online);
                let cas = self
                    .bridge
                    .compare_and_swap(
                        &key,
                        Some(&current),
                        &serde_json::to_string(&next)?,
                        Some(self.settings.session_ttl()),
                    )
                    .await?;
                if cas.swapped {
                    self.emit(next);
                }
            }
            None => {
                let next = PresenceRecord::now(user_id.clone(), PresenceStatus::Online);
                let cas = self
                    .bridge
                    .compare_and_swap(
                        &key,
                        None,
                        &serde_json::to_string(&next)?,
                        Some(self.settings.session_ttl()),
                    )
                    .await?;
                if cas.swapped {
                    self.emit(next);
                }
            }
        }
        Ok(())
    }

    /// Refreshes the presence TTL; resurrects the record as online if it
    /// lapsed while the connection stayed up.
    pub async fn touch(&self, user_id: &UserId) -> Result<(), RegistryError> {
        let extended = self
            .bridge
            .extend_ttl(&presence_key(user_id), self.settings.session_ttl())
            .await?;
        if !extended {
            self.mark_online(user_id).await?;
        }
        Ok(())
    }

    /// Transitions a live user to away (last connection dropped; the
    /// session TTL keeps counting toward offline).
    pub async fn mark_away(&self, user_id: &UserId) -> Result<(), RegistryError> {
        let Some((current, record)) = self.read_raw(user_id).await? else {
            return Ok(());
        };
        if !record.status.is_live() {
            return Ok(());
        }
        let next = PresenceRecord::now(user_id.clone(), PresenceStatus::Away);
        let cas = self
            .bridge
            .compare_and_swap(
                &presence_key(user_id),
                Some(&current),
                &serde_json::to_string(&next)?,
                Some(self.settings.session_ttl()),
            )
            .await?;
        if cas.swapped {
            self.emit(next);
        }
        Ok(())
    }

    /// Transitions to offline after a session TTL lapse. Concurrent
    /// sweeps from peer instances race on the CAS; only the winner emits
    /// and reports `true`.
    pub async fn mark_offline_if_lapsed(&self, user_id: &UserId) -> Result<bool, RegistryError> {
        let key = presence_key(user_id);
        let next = PresenceRecord::now(user_id.clone(), PresenceStatus::Offline);
        let json = serde_json::to_string(&next)?;
        let cas = match self.read_raw(user_id).await? {
            Some((_, record)) if record.status == PresenceStatus::Offline => return Ok(false),
            Some((current, _)) => {
                self.bridge
                    .compare_and_swap(&key, Some(&current), &json, Some(self.settings.session_ttl()))
                    .await?
            }
            None => {
                self.bridge
                    .compare_and_swap(&key, None, &json, Some(self.settings.session_ttl()))
                    .await?
            }
        };
        if cas.swapped {
            self.emit(next);
        }
        Ok(cas.swapped)
    }

    /// Applies a client-requested status. Typing arms its decay;
    /// `offline` cannot be requested and is ignored.
    pub async fn set_status(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
    ) -> Result<(), RegistryError> {
        match status {
            PresenceStatus::Typing => self.set_typing(user_id).await,
            PresenceStatus::Online => self.mark_online(user_id).await,
            PresenceStatus::Away => self.mark_away(user_id).await,
            PresenceStatus::Offline => {
                debug!(user = %user_id, "ignoring client-requested offline");
                Ok(())
            }
        }
    }

    async fn set_typing(&self, user_id: &UserId) -> Result<(), RegistryError> {
        let prior = self.read_raw(user_id).await?;
        let record = PresenceRecord::now(user_id.clone(), PresenceStatus::Typing);
        let json = serde_json::to_string(&record)?;
        self.bridge
            .put_value(
                &presence_key(user_id),
                &json,
                Some(self.settings.session_ttl()),
            )
            .await?;
        let was_typing = prior
            .as_ref()
            .is_some_and(|(_, r)| r.status == PresenceStatus::Typing);
        if !was_typing {
            self.emit(record);
        }
        let _ = self.decay.send(DecayOrder {
            user_id: user_id.clone(),
            armed: json,
            deadline: Instant::now() + self.settings.typing_ttl(),
        });
        Ok(())
    }

    /// Decays typing back to online if the record has not changed since
    /// `armed` was written.
    pub(crate) async fn decay_typing(
        &self,
        user_id: &UserId,
        armed: &str,
    ) -> Result<(), RegistryError> {
        let next = PresenceRecord::now(user_id.clone(), PresenceStatus::Online);
        let cas = self
            .bridge
            .compare_and_swap(
                &presence_key(user_id),
                Some(armed),
                &serde_json::to_string(&next)?,
                Some(self.settings.session_ttl()),
            )
            .await?;
        if cas.swapped {
            self.emit(next);
        }
        Ok(())
    }

    async fn read_raw(
        &self,
        user_id: &UserId,
    ) -> Result<Option<(String, PresenceRecord)>, RegistryError> {
        let Some(json) = self.bridge.get_value(&presence_key(user_id)).await? else {
            return Ok(None);
        };
        let record: PresenceRecord = serde_json::from_str(&json)?;
        Ok(Some((json, record)))
    }

    fn normalize(&self, record: PresenceRecord) -> PresenceRecord {
        if record.status != PresenceStatus::Typing {
            return record;
        }
        let Ok(stamp) = chrono::DateTime::parse_from_rfc3339(&record.last_activity) else {
            return record;
        };
        let age = Utc::now().signed_duration_since(stamp.with_timezone(&Utc));
        match chrono::Duration::from_std(self.settings.typing_ttl()) {
            Ok(ttl) if age > ttl => PresenceRecord {
                status: PresenceStatus::Online,
                ..record
            },
            _ => record,
        }
    }

    fn emit(&self, record: PresenceRecord) {
        if let Err(error) = self.changes.try_send(record) {
            warn!(%error, "presence change dropped, consumer lagging");
        }
    }
}

async fn decay_worker(
    tracker: Weak<PresenceTracker>,
    mut orders: mpsc::UnboundedReceiver<DecayOrder>,
) {
    // Orders share one TTL, so deadlines arrive in order and a simple
    // sequential sleep suffices.
    while let Some(order) = orders.recv().await {
        tokio::time::sleep_until(order.deadline).await;
        let Some(tracker) = tracker.upgrade() else {
            break;
        };
        if let Err(error) = tracker.decay_typing(&order.user_id, &order.armed).await {
            debug!(user = %order.user_id, %error, "typing decay skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_cluster::MemoryBroker;
    use banter_core::InstanceId;

    fn settings() -> PresenceSettings {
        PresenceSettings {
            session_ttl_secs: 90,
            sweep_interval_secs: 30,
            typing_ttl_secs: 6,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<PresenceRecord>) -> Vec<PresenceStatus> {
        let mut statuses = Vec::new();
        while let Ok(record) = rx.try_recv() {
            statuses.push(record.status);
        }
        statuses
    }

    #[tokio::test]
    async fn online_is_emitted_once_per_transition() {
        let broker = MemoryBroker::new(16);
        let bridge = broker.bridge(InstanceId::from("a"));
        let (tracker, mut rx) = PresenceTracker::new(bridge, settings());
        let user = UserId::from("alice");

        tracker.mark_online(&user).await.unwrap();
        tracker.mark_online(&user).await.unwrap();
        assert_eq!(drain(&mut rx), vec![PresenceStatus::Online]);

        let record = tracker.read(&user).await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn away_requires_a_live_record() {
        let broker = MemoryBroker::new(16);
        let bridge = broker.bridge(InstanceId::from("a"));
        let (tracker, mut rx) = PresenceTracker::new(bridge, settings());
        let user = UserId::from("alice");

        // No record yet: nothing to mark away.
        tracker.mark_away(&user).await.unwrap();
        assert!(drain(&mut rx).is_empty());

        tracker.mark_online(&user).await.unwrap();
        tracker.mark_away(&user).await.unwrap();
        // Away twice is a no-op the second time.
        tracker.mark_away(&user).await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![PresenceStatus::Online, PresenceStatus::Away]
        );
    }

    #[tokio::test]
    async fn offline_has_a_single_winner_across_instances() {
        let broker = MemoryBroker::new(16);
        let (t1, mut rx1) =
            PresenceTracker::new(broker.bridge(InstanceId::from("a")), settings());
        let (t2, mut rx2) =
            PresenceTracker::new(broker.bridge(InstanceId::from("b")), settings());
        let user = UserId::from("alice");

        let first = t1.mark_offline_if_lapsed(&user).await.unwrap();
        let second = t2.mark_offline_if_lapsed(&user).await.unwrap();
        assert!(first);
        assert!(!second);

        let emitted = drain(&mut rx1).len() + drain(&mut rx2).len();
        assert_eq!(emitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_decays_back_to_online() {
        let broker = MemoryBroker::new(16);
        let bridge = broker.bridge(InstanceId::from("a"));
        let (tracker, mut rx) = PresenceTracker::new(bridge, settings());
        let user = UserId::from("alice");

        tracker.mark_online(&user).await.unwrap();
        tracker
            .set_status(&user, PresenceStatus::Typing)
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![PresenceStatus::Online, PresenceStatus::Typing]
        );

        tokio::time::advance(Duration::from_secs(7)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert_eq!(drain(&mut rx), vec![PresenceStatus::Online]);
        let record = tracker.read(&user).await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn stale_decay_order_is_ignored() {
        let broker = MemoryBroker::new(16);
        let bridge = broker.bridge(InstanceId::from("a"));
        let (tracker, mut rx) = PresenceTracker::new(bridge, settings());
        let user = UserId::from("alice");

        tracker.mark_online(&user).await.unwrap();
        let _ = drain(&mut rx);

        // Decay armed against JSON that is no longer current: no-op.
        tracker
            .decay_typing(&user, "{\"stale\":true}")
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
        let record = tracker.read(&user).await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resurrects_a_lapsed_record() {
        let broker = MemoryBroker::new(16);
        let bridge = broker.bridge(InstanceId::from("a"));
        let (tracker, mut rx) = PresenceTracker::new(bridge, settings());
        let user = UserId::from("alice");

        tracker.mark_online(&user).await.unwrap();
        let _ = drain(&mut rx);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(tracker.read(&user).await.unwrap().is_none());

        tracker.touch(&user).await.unwrap();
        assert_eq!(drain(&mut rx), vec![PresenceStatus::Online]);
    }

    #[tokio::test]
    async fn client_cannot_request_offline() {
        let broker = MemoryBroker::new(16);
        let bridge = broker.bridge(InstanceId::from("a"));
        let (tracker, mut rx) = PresenceTracker::new(bridge, settings());
        let user = UserId::from("alice");

        tracker.mark_online(&user).await.unwrap();
        let _ = drain(&mut rx);

        tracker
            .set_status(&user, PresenceStatus::Offline)
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
        let record = tracker.read(&user).await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
    }
}
