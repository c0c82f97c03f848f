//! Axum HTTP + WebSocket gateway.
//!
//! Accepts authenticated WebSocket clients, runs their session lifecycle
//! (subscribe, heartbeat, presence), and exposes the REST surface used by
//! chat engines to publish events and by operators to inspect the node.

#![deny(unsafe_code)]

pub mod health;
pub mod metrics;
pub mod presence_bridge;
pub mod server;
pub mod shutdown;
pub mod websocket;
