//! Client/server WebSocket frames.
//!
//! Everything on the socket is `type`-tagged camelCase JSON. Client frames
//! arrive after the authenticated handshake; server frames are either
//! channel events, acks, or status notices (the only way errors reach the
//! client).

use crate::event::{Event, PresenceStatus};
use banter_core::{ChannelId, ConnectionId, SessionId};
use serde::{Deserialize, Serialize};

/// Frames the client sends after the handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Attach to a channel's live stream, optionally resuming after a
    /// previously seen sequence.
    Subscribe {
        /// Channel to attach to.
        channel_id: ChannelId,
        /// Last sequence the client has already applied, if resuming.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<u64>,
    },
    /// Detach from a channel.
    Unsubscribe {
        /// Channel to detach from.
        channel_id: ChannelId,
    },
    /// Keep the session's TTL fresh. Any frame refreshes it; this one
    /// exists for otherwise-idle clients.
    Heartbeat,
    /// Update the sender's presence as seen by a channel's peers.
    Presence {
        /// Channel whose peers should see the update.
        channel_id: ChannelId,
        /// New status (`typing` decays back to `online` server-side).
        status: PresenceStatus,
    },
}

/// Frames the server sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// First frame after a successful handshake.
    Connected {
        /// Id of this connection.
        connection_id: ConnectionId,
        /// Session the connection was registered into.
        session_id: SessionId,
    },
    /// Subscription acknowledgment. Sent only after authorization and, when
    /// resuming, after the replay range was established.
    Subscribed {
        /// Channel attached.
        channel_id: ChannelId,
        /// Highest sequence delivered by replay, if any was requested.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replayed_to: Option<u64>,
    },
    /// One channel event (replayed or live — indistinguishable on the wire).
    Event {
        /// The event envelope.
        #[serde(flatten)]
        event: Event,
    },
    /// Status notice: errors and degradation signals.
    Status {
        /// Stable machine-readable code (`banter_core::codes`).
        code: String,
        /// Human-readable description.
        message: String,
        /// Channel the notice concerns, when scoped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<ChannelId>,
    },
}

impl ServerFrame {
    /// Build a status frame.
    #[must_use]
    pub fn status(
        code: impl Into<String>,
        message: impl Into<String>,
        channel_id: Option<ChannelId>,
    ) -> Self {
        Self::Status {
            code: code.into(),
            message: message.into(),
            channel_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
