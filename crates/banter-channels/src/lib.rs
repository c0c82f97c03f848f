//! # banter-channels
//!
//! Per-channel event fan-out for the Banter realtime layer.
//!
//! The [`ChannelHub`] multiplexes every channel an instance touches:
//!
//! - **Sequencing**: publishes happen under a cluster lease, so exactly one
//!   instance assigns a channel's gap-free, monotonically increasing
//!   sequence numbers
//! - **Retention**: each event lands in the shared store's retention ring
//!   (and a local mirror) before fan-out, powering reconnect replay and
//!   backfill
//! - **Ordering**: cross-instance arrivals pass through a reorder buffer;
//!   holes that outlive the reorder window are backfilled from the ring
//! - **Lifecycle**: terminal control events close a channel cluster-wide
//!   until it is explicitly reopened; idle channels are swept

#![deny(unsafe_code)]

pub mod hub;
pub mod reorder;
pub mod ring;

pub use hub::ChannelHub;
pub use reorder::{Offer, PendingEvent, ReorderBuffer};
pub use ring::{RetainedEvent, RetentionRing};
