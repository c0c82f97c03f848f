//! Stored record shapes and key layout for the shared store.
//!
//! Keys: `session/{user_id}`, `conn/{session_id}/{connection_id}`, and
//! `presence/{user_id}`. All values are JSON; the session and connection
//! records carry TTLs refreshed by heartbeats.

use banter_core::{ConnectionId, InstanceId, SessionId, UserId};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Value stored under `session/{user_id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub created_at: String,
}

impl SessionRecord {
    /// Fresh record with a newly minted session ID.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(SessionId::new())
    }

    /// Record re-created under an existing session ID, e.g. when a
    /// heartbeat finds the key lapsed mid-session.
    #[must_use]
    pub fn with_id(session_id: SessionId) -> Self {
        Self {
            session_id,
            created_at: now_stamp(),
        }
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Value stored under `conn/{session_id}/{connection_id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Instance currently terminating the socket.
    pub instance_id: InstanceId,
    pub last_seen: String,
}

impl ConnectionRecord {
    /// Record stamped with the current time.
    #[must_use]
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            last_seen: now_stamp(),
        }
    }
}

pub(crate) fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn session_key(user_id: &UserId) -> String {
    format!("session/{user_id}")
}

pub(crate) fn conn_key(session_id: &SessionId, connection_id: &ConnectionId) -> String {
    format!("conn/{session_id}/{connection_id}")
}

pub(crate) fn conn_prefix(session_id: &SessionId) -> String {
    format!("conn/{session_id}/")
}

pub(crate) fn presence_key(user_id: &UserId) -> String {
    format!("presence/{user_id}")
}
