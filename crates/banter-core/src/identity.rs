//! The validated principal behind a connection.

use crate::ids::UserId;
use serde::{Deserialize, Serialize};

/// Identity extracted from a validated bearer credential.
///
/// Immutable for the lifetime of a connection. Roles are opaque strings
/// interpreted by the authorization seam; this layer never mints or
/// mutates them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user identifier (the credential's subject).
    pub user_id: UserId,
    /// Role strings granted by the credential.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    /// Build an identity from a user id and role set.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, roles: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
        }
    }

    /// True if the identity carries the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
