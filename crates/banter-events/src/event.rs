//! The channel event envelope and presence vocabulary.
//!
//! An [`Event`] is immutable once published: the owning instance assigns the
//! sequence number, stamps the timestamp, and every copy that reaches a
//! subscriber — locally or across the cluster — is byte-identical.

use banter_core::{ChannelId, UserId};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a channel event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Streaming token/content fragment from the inference engine.
    Delta,
    /// Stream control: terminal done/error, reopen notices.
    Control,
    /// Presence change relevant to the channel (online, typing, ...).
    Presence,
}

impl EventKind {
    /// Wire name of the kind, for log fields and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delta => "delta",
            Self::Control => "control",
            Self::Presence => "presence",
        }
    }
}

/// All event kinds, for exhaustive wire tests.
pub const ALL_EVENT_KINDS: &[EventKind] =
    &[EventKind::Delta, EventKind::Control, EventKind::Presence];

/// Signals carried in a control event's `payload.signal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlSignal {
    /// Stream completed normally. Terminal.
    Done,
    /// Stream aborted with an error. Terminal.
    Error,
    /// Channel was explicitly reopened after a terminal signal.
    Reopened,
}

impl ControlSignal {
    /// True for signals that end a channel's stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One immutable event on a channel's ordered stream.
///
/// Wire format (camelCase):
/// ```json
/// {"channelId":"c1","sequence":4,"kind":"delta","payload":{"text":"…"},"timestamp":"2025-06-01T10:00:00.000Z"}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Channel this event belongs to.
    pub channel_id: ChannelId,
    /// Position in the channel's gap-free sequence, starting at 1.
    pub sequence: u64,
    /// Event kind.
    pub kind: EventKind,
    /// Kind-specific payload. Opaque to this layer for deltas.
    pub payload: Value,
    /// ISO 8601 timestamp assigned at publish.
    pub timestamp: String,
}

impl Event {
    /// Build an event stamped with the current UTC time.
    #[must_use]
    pub fn new(channel_id: ChannelId, sequence: u64, kind: EventKind, payload: Value) -> Self {
        Self {
            channel_id,
            sequence,
            kind,
            payload,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// The control signal, if this is a control event with a valid one.
    #[must_use]
    pub fn control_signal(&self) -> Option<ControlSignal> {
        if self.kind != EventKind::Control {
            return None;
        }
        self.payload
            .get("signal")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// True if this event ends the channel's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.control_signal().is_some_and(ControlSignal::is_terminal)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Presence
// ─────────────────────────────────────────────────────────────────────────────

/// Presence status of an identity.
///
/// `away` marks the TTL countdown after the last live connection dropped;
/// `offline` only after the whole session's TTL lapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// At least one connection is live.
    Online,
    /// Actively composing; decays back to online.
    Typing,
    /// No live connection, session TTL still running.
    Away,
    /// Session evicted after TTL lapse.
    Offline,
}

impl PresenceStatus {
    /// True for statuses implying at least one live connection.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Online | Self::Typing)
    }
}

/// All presence statuses, for exhaustive wire tests.
pub const ALL_PRESENCE_STATUSES: &[PresenceStatus] = &[
    PresenceStatus::Online,
    PresenceStatus::Typing,
    PresenceStatus::Away,
    PresenceStatus::Offline,
];

/// TTL-bounded presence record, eventually consistent cluster-wide.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Identity the record describes.
    pub user_id: UserId,
    /// Current merged status across the identity's connections.
    pub status: PresenceStatus,
    /// ISO 8601 timestamp of the last activity that refreshed the record.
    pub last_activity: String,
}

impl PresenceRecord {
    /// Build a record stamped with the current UTC time.
    #[must_use]
    pub fn now(user_id: UserId, status: PresenceStatus) -> Self {
        Self {
            user_id,
            status,
            last_activity: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
