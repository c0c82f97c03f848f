//! WebSocket connection management, frame dispatch, and session lifecycle.

pub mod connection;
pub mod handler;
pub mod manager;
pub mod session;
