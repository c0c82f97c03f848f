//! Routes presence lifecycle transitions into the channels their peers
//! watch.
//!
//! The tracker emits one [`PresenceRecord`] per settled transition. Typing
//! records are skipped here: typing is channel-scoped and the frame handler
//! publishes it straight into the channel named by the client. Lifecycle
//! transitions (online, away, offline) are session-scoped, so this bridge
//! fans each one into the union of channels the user's local connections
//! are subscribed to.

use std::collections::HashSet;
use std::sync::Arc;

use banter_channels::ChannelHub;
use banter_core::{ChannelId, PublishError};
use banter_events::{EventKind, PresenceRecord, PresenceStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::websocket::manager::ConnectionManager;

/// Spawns the bridge loop. Runs until the tracker drops its change sender.
pub fn run_presence_bridge(
    hub: Arc<ChannelHub>,
    manager: Arc<ConnectionManager>,
    mut changes: mpsc::Receiver<PresenceRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = changes.recv().await {
            if record.status == PresenceStatus::Typing {
                continue;
            }
            let channels = watched_channels(&hub, &manager, &record);
            if channels.is_empty() {
                // No local connection watches this user's channels; a peer
                // instance with one will route the same transition.
                debug!(user = %record.user_id, status = ?record.status, "presence change with no local audience");
                continue;
            }
            let payload = match serde_json::to_value(&record) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(%error, "presence record failed to serialize");
                    continue;
                }
            };
            for channel_id in channels {
                match hub
                    .publish(&channel_id, EventKind::Presence, payload.clone())
                    .await
                {
                    Ok(_) => {}
                    Err(PublishError::LeaseConflict { holder, .. }) => {
                        // Presence is soft TTL state; the canonical record
                        // stays queryable, so the hint is dropped rather
                        // than routed to the holder.
                        debug!(channel = %channel_id, %holder, "presence update dropped, lease held elsewhere");
                    }
                    Err(error) => {
                        debug!(%error, channel = %channel_id, "presence publish failed");
                    }
                }
            }
        }
    })
}

/// Union of channels the user's local connections are attached to.
fn watched_channels(
    hub: &ChannelHub,
    manager: &ConnectionManager,
    record: &PresenceRecord,
) -> HashSet<ChannelId> {
    let mut channels = HashSet::new();
    for connection in manager.connections_of_user(&record.user_id) {
        channels.extend(hub.channels_of(&connection.id));
    }
    channels
}
