//! # banter-core
//!
//! Foundation types, errors, and branded IDs for the Banter realtime layer.
//!
//! This crate provides the shared vocabulary the other `banter-*` crates
//! depend on:
//!
//! - **Branded IDs**: `UserId`, `ConnectionId`, `SessionId`, `ChannelId`,
//!   `InstanceId` as newtypes for type safety
//! - **Identity**: the validated principal behind a connection (user id plus
//!   role strings)
//! - **Errors**: subscribe/publish/replay error hierarchy via `thiserror`,
//!   plus the stable status codes surfaced to clients

#![deny(unsafe_code)]

pub mod errors;
pub mod identity;
pub mod ids;

pub use errors::{
    PublishError, RealtimeError, SequenceGapError, SubscribeError, codes,
};
pub use identity::Identity;
pub use ids::{ChannelId, ConnectionId, InstanceId, SessionId, UserId};
