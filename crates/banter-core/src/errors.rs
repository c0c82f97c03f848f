//! Error hierarchy for the realtime layer, plus the stable status codes
//! surfaced to clients.
//!
//! Auth and cluster transport errors live with their crates
//! (`banter-auth::AuthError`, `banter-cluster::ClusterError`); everything
//! maps onto the code constants here when it crosses the wire.

use crate::ids::{ChannelId, InstanceId};

/// Machine-readable status codes carried by wire status frames and used as
/// metrics labels. Stable; never renumber or rename.
pub mod codes {
    /// Credential missing, malformed, expired, or rejected.
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    /// Identity is not authorized for the requested channel.
    pub const UNAUTHORIZED_CHANNEL: &str = "UNAUTHORIZED_CHANNEL";
    /// Publish attempted on a channel already ended by a terminal event.
    pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";
    /// Another instance holds the channel's sequence lease.
    pub const LEASE_CONFLICT: &str = "LEASE_CONFLICT";
    /// A sequence hole outlived the reorder window.
    pub const SEQUENCE_GAP: &str = "SEQUENCE_GAP";
    /// The cluster broker is unreachable; running degraded.
    pub const BROKER_UNAVAILABLE: &str = "BROKER_UNAVAILABLE";
    /// Requested sequence predates the retention window; full resync needed.
    pub const RESYNC_REQUIRED: &str = "RESYNC_REQUIRED";
    /// Inbound frame could not be parsed.
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    /// Outbound queue overflowed; connection closed.
    pub const QUEUE_OVERFLOW: &str = "QUEUE_OVERFLOW";
    /// Instance connection cap reached.
    pub const CONNECTION_LIMIT: &str = "CONNECTION_LIMIT";
    /// Unexpected internal error.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

    /// All status codes, for exhaustive wire tests.
    pub const ALL_STATUS_CODES: &[&str] = &[
        AUTH_FAILED,
        UNAUTHORIZED_CHANNEL,
        CHANNEL_CLOSED,
        LEASE_CONFLICT,
        SEQUENCE_GAP,
        BROKER_UNAVAILABLE,
        RESYNC_REQUIRED,
        INVALID_FRAME,
        QUEUE_OVERFLOW,
        CONNECTION_LIMIT,
        INTERNAL_ERROR,
    ];
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscribe
// ─────────────────────────────────────────────────────────────────────────────

/// Failure attaching a connection to a channel. The connection stays open;
/// the client receives a status frame with the matching code.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// Identity lacks the role required for this channel.
    #[error("not authorized for channel {channel_id}")]
    Unauthorized {
        /// Channel the subscribe targeted.
        channel_id: ChannelId,
    },

    /// The requested resume point predates the retention window.
    #[error(
        "channel {channel_id}: last seen {requested} predates retention \
         (oldest retained: {oldest_retained:?})"
    )]
    ResyncRequired {
        /// Channel the subscribe targeted.
        channel_id: ChannelId,
        /// Sequence the client claims to have seen last.
        requested: u64,
        /// Oldest sequence still retained, if the ring is non-empty.
        oldest_retained: Option<u64>,
    },

    /// The broker was unreachable while establishing the subscription.
    #[error("cluster broker unavailable")]
    BrokerUnavailable,
}

impl SubscribeError {
    /// Stable status code for this variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => codes::UNAUTHORIZED_CHANNEL,
            Self::ResyncRequired { .. } => codes::RESYNC_REQUIRED,
            Self::BrokerUnavailable => codes::BROKER_UNAVAILABLE,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Publish
// ─────────────────────────────────────────────────────────────────────────────

/// Failure assigning or delivering a new event on a channel.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The channel was ended by a terminal control event and not reopened.
    #[error("channel {channel_id} is closed")]
    ChannelClosed {
        /// Channel the publish targeted.
        channel_id: ChannelId,
    },

    /// Another instance holds the sequence lease; retry with backoff or
    /// route the publish to the holder.
    #[error("channel {channel_id} lease held by {holder}")]
    LeaseConflict {
        /// Channel the publish targeted.
        channel_id: ChannelId,
        /// Instance currently holding the lease.
        holder: InstanceId,
    },

    /// The broker was unreachable and no local lease was already held.
    #[error("cluster broker unavailable")]
    BrokerUnavailable,
}

impl PublishError {
    /// Stable status code for this variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelClosed { .. } => codes::CHANNEL_CLOSED,
            Self::LeaseConflict { .. } => codes::LEASE_CONFLICT,
            Self::BrokerUnavailable => codes::BROKER_UNAVAILABLE,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sequence gaps
// ─────────────────────────────────────────────────────────────────────────────

/// A hole in a channel's sequence stream outlived the reorder window.
///
/// Internal to the hub: it triggers backfill and is only surfaced to clients
/// (as `RESYNC_REQUIRED`) when backfill itself cannot close the hole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("channel {channel_id}: expected sequence {expected}, observed {observed}")]
pub struct SequenceGapError {
    /// Channel with the hole.
    pub channel_id: ChannelId,
    /// Sequence the consumer expected next.
    pub expected: u64,
    /// Lowest buffered sequence above the hole.
    pub observed: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Umbrella
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level error for callers that cross component boundaries (REST ingest,
/// gateway wiring).
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// Subscribe-path failure.
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    /// Publish-path failure.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Unhealable sequence gap.
    #[error(transparent)]
    Gap(#[from] SequenceGapError),

    /// Anything without a more specific home.
    #[error("{message}")]
    Internal {
        /// Stable machine-readable code.
        code: &'static str,
        /// Human-readable description.
        message: String,
    },
}

impl RealtimeError {
    /// Stable status code for this variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Subscribe(e) => e.code(),
            Self::Publish(e) => e.code(),
            Self::Gap(_) => codes::SEQUENCE_GAP,
            Self::Internal { code, .. } => code,
        }
    }

    /// Build an internal error with the generic code.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: codes::INTERNAL_ERROR,
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
