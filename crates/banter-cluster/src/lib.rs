//! Cluster bridge for the Banter realtime layer.
//!
//! Instances coordinate through a broker that does two jobs: fan
//! published events out to every instance subscribed to a topic, and
//! hold the small amount of shared state the layer needs — session and
//! presence records with TTLs, single-writer leases, sequence
//! watermarks, and per-channel retention rings for reconnect replay.
//!
//! The [`ClusterBridge`] trait abstracts the transport. A single-node
//! deployment uses the in-process [`MemoryBroker`]; a multi-node
//! deployment points every instance's [`BrokerLink`] at one
//! [`BrokerServer`]. An instance that loses its broker keeps serving
//! local traffic in a degraded state and recovers through the bridge's
//! state watch when the connection returns.

#![deny(unsafe_code)]

pub mod backoff;
pub mod bridge;
pub mod broker;
pub mod errors;
pub mod frame;
pub mod link;
pub mod memory;
pub mod store;

pub use backoff::ExponentialBackoff;
pub use bridge::{BridgeMessage, BridgeState, CasResult, ClusterBridge, MessageHandler};
pub use broker::BrokerServer;
pub use errors::ClusterError;
pub use frame::{Frame, PROTOCOL_VERSION};
pub use link::BrokerLink;
pub use memory::{MemoryBridge, MemoryBroker};
pub use store::{LeaseOutcome, RingEntry, RingSlice, StoreRequest, StoreResponse};
