//! Session registry and presence tracking for the Banter realtime layer.
//!
//! Sessions group one identity's connections across devices and
//! instances; presence is session-scoped and merged as the maximum
//! liveness across those connections. Canonical state lives in the
//! cluster-shared store behind the bridge's TTL and compare-and-swap
//! primitives, so any instance can answer for any user and concurrent
//! transitions settle on a single winner.

#![deny(unsafe_code)]

pub mod errors;
pub mod records;
pub mod registry;
pub mod tracker;

pub use errors::RegistryError;
pub use records::{ConnectionRecord, SessionRecord};
pub use registry::SessionRegistry;
pub use tracker::PresenceTracker;
