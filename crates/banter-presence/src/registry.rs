//! Cluster-shared session registry.
//!
//! A session groups one identity's connections across devices and
//! instances. Creation races between devices settle by compare-and-swap
//! on `session/{user_id}`: the loser adopts the winner's session ID.
//! Heartbeats refresh the connection, session, and presence TTLs; a
//! periodic sweep turns lapsed sessions into offline presence, exactly
//! once cluster-wide.

use std::sync::Arc;

use banter_cluster::ClusterBridge;
use banter_core::{ConnectionId, Identity, SessionId, UserId};
use banter_settings::PresenceSettings;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::RegistryError;
use crate::records::{ConnectionRecord, SessionRecord, conn_key, conn_prefix, session_key};
use crate::tracker::PresenceTracker;

const CREATE_RETRIES: usize = 3;

/// Session registry backed by the cluster-shared store.
pub struct SessionRegistry {
    bridge: Arc<dyn ClusterBridge>,
    tracker: Arc<PresenceTracker>,
    settings: PresenceSettings,
    /// Users whose sessions this instance has seen; the sweep checks
    /// these for TTL lapse.
    tracked: DashMap<UserId, SessionId>,
}

impl SessionRegistry {
    pub fn new(
        bridge: Arc<dyn ClusterBridge>,
        tracker: Arc<PresenceTracker>,
        settings: PresenceSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            tracker,
            settings,
            tracked: DashMap::new(),
        })
    }

    /// Binds a new connection to the identity's session, creating the
    /// session if none exists. Idempotent: repeat connections from the
    /// same identity join the existing session.
    pub async fn register(
        &self,
        identity: &Identity,
        connection_id: &ConnectionId,
    ) -> Result<SessionId, RegistryError> {
        let user_id = &identity.user_id;
        let key = session_key(user_id);
        let ttl = self.settings.session_ttl();

        let mut session_id = None;
        for _ in 0..CREATE_RETRIES {
            let fresh = SessionRecord::new();
            let json = serde_json::to_string(&fresh)?;
            let cas = self
                .bridge
                .compare_and_swap(&key, None, &json, Some(ttl))
                .await?;
            if cas.swapped {
                session_id = Some(fresh.session_id);
                break;
            }
            if let Some(current) = cas.current {
                let existing: SessionRecord = serde_json::from_str(&current)?;
                let _ = self.bridge.extend_ttl(&key, ttl).await?;
                session_id = Some(existing.session_id);
                break;
            }
            // The record expired between our read and swap; go again.
        }
        let session_id = session_id
            .ok_or_else(|| RegistryError::Unsettled("session create race".into()))?;

        let record = ConnectionRecord::new(self.bridge.instance_id().clone());
        self.bridge
            .put_value(
                &conn_key(&session_id, connection_id),
                &serde_json::to_string(&record)?,
                Some(ttl),
            )
            .await?;

        self.tracker.mark_online(user_id).await?;
        let _ = self
            .tracked
            .insert(user_id.clone(), session_id.clone());
        Ok(session_id)
    }

    /// Refreshes the connection, session, and presence TTLs. Called on
    /// heartbeat frames and, cheaply, on any inbound traffic.
    pub async fn heartbeat(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<(), RegistryError> {
        let ttl = self.settings.session_ttl();
        let record = ConnectionRecord::new(self.bridge.instance_id().clone());
        self.bridge
            .put_value(
                &conn_key(session_id, connection_id),
                &serde_json::to_string(&record)?,
                Some(ttl),
            )
            .await?;

        let key = session_key(user_id);
        if !self.bridge.extend_ttl(&key, ttl).await? {
            // Lapsed mid-session (e.g. a long stall); restore under the
            // same ID so the client's world does not change.
            let restored = SessionRecord::with_id(session_id.clone());
            self.bridge
                .put_value(&key, &serde_json::to_string(&restored)?, Some(ttl))
                .await?;
        }

        self.tracker.touch(user_id).await?;
        Ok(())
    }

    /// Removes a connection. If it was the session's last live
    /// connection cluster-wide, presence drops to away and the session
    /// TTL starts counting toward offline.
    pub async fn disconnect(
        &self,
        user_id: &UserId,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<(), RegistryError> {
        let _ = self
            .bridge
            .remove_value(&conn_key(session_id, connection_id))
            .await?;
        let remaining = self.bridge.prefix_count(&conn_prefix(session_id)).await?;
        if remaining == 0 {
            self.tracker.mark_away(user_id).await?;
        }
        Ok(())
    }

    /// Evicts sessions whose TTL lapsed, emitting offline presence for
    /// each. Safe to run concurrently on every instance: the offline
    /// transition is a compare-and-swap and only the winner emits.
    /// Returns the number of evictions this run won.
    pub async fn expire_sweep(&self) -> Result<u64, RegistryError> {
        let candidates: Vec<UserId> = self
            .tracked
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut evicted = 0;
        for user_id in candidates {
            if self
                .bridge
                .get_value(&session_key(&user_id))
                .await?
                .is_some()
            {
                continue;
            }
            if self.tracker.mark_offline_if_lapsed(&user_id).await? {
                evicted += 1;
                info!(user = %user_id, "session lapsed, presence offline");
            }
            // Won or lost, the lapse is handled; stop watching the user
            // until they register again.
            let _ = self.tracked.remove(&user_id);
        }
        Ok(evicted)
    }

    /// Number of live sessions cluster-wide.
    pub async fn active_sessions(&self) -> Result<u64, RegistryError> {
        Ok(self.bridge.prefix_count("session/").await?)
    }

    /// Number of live connections for one session.
    pub async fn live_connections(
        &self,
        session_id: &SessionId,
    ) -> Result<u64, RegistryError> {
        Ok(self.bridge.prefix_count(&conn_prefix(session_id)).await?)
    }

    /// Spawns the periodic sweep loop.
    pub fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.settings.sweep_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        metrics::counter!("sweep_runs_total").increment(1);
                        match self.expire_sweep().await {
                            Ok(0) => {}
                            Ok(evicted) => {
                                metrics::counter!("sweep_evictions_total").increment(evicted);
                                info!(evicted, "presence sweep evicted sessions");
                            }
                            Err(error) => warn!(%error, "presence sweep failed"),
                        }
                        if let Ok(live) = self.active_sessions().await {
                            #[allow(clippy::cast_precision_loss)]
                            metrics::gauge!("sessions_active").set(live as f64);
                        }
                    }
                }
            }
        })
    }
}
