//! # banter-events
//!
//! Event model and client wire frames for the Banter realtime layer.
//!
//! - **Events**: the `{channelId, sequence, kind, payload, timestamp}`
//!   envelope every subscriber receives, with `delta` / `control` /
//!   `presence` kinds and terminal-signal detection
//! - **Presence**: status vocabulary and the TTL-bounded presence record
//! - **Frames**: the `type`-tagged camelCase JSON exchanged over the
//!   WebSocket, matching the chat-web client exactly
//!
//! Wire strings are load-bearing — browser clients pin them. Changes here
//! are protocol changes.

#![deny(unsafe_code)]

pub mod event;
pub mod frames;

pub use event::{
    ALL_EVENT_KINDS, ALL_PRESENCE_STATUSES, ControlSignal, Event, EventKind,
    PresenceRecord, PresenceStatus,
};
pub use frames::{ClientFrame, ServerFrame};
