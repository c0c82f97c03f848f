//! Channel subscription policy.
//!
//! Which identities may read which channels is owned by the REST layer's
//! ACLs; this seam only enforces the role-level gate it delegates down.

use banter_core::{ChannelId, Identity};

/// Decides whether an authenticated identity may subscribe to a channel.
pub trait ChannelAuthorizer: Send + Sync {
    /// True if `identity` may attach to `channel_id`.
    fn may_subscribe(&self, identity: &Identity, channel_id: &ChannelId) -> bool;
}

/// Any authenticated identity may subscribe to any channel.
///
/// The default for deployments where the REST layer hands out channel ids
/// only to authorized users (capability-style).
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAuthenticated;

impl ChannelAuthorizer for AllowAuthenticated {
    fn may_subscribe(&self, _identity: &Identity, _channel_id: &ChannelId) -> bool {
        true
    }
}

/// Requires a specific role string on every subscribe.
#[derive(Clone, Debug)]
pub struct RoleGated {
    required_role: String,
}

impl RoleGated {
    /// Gate all channels behind `role`.
    #[must_use]
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            required_role: role.into(),
        }
    }
}

impl ChannelAuthorizer for RoleGated {
    fn may_subscribe(&self, identity: &Identity, _channel_id: &ChannelId) -> bool {
        identity.has_role(&self.required_role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_authenticated_always_passes() {
        let identity = Identity::new("alice", vec![]);
        assert!(AllowAuthenticated.may_subscribe(&identity, &ChannelId::from("c1")));
    }

    #[test]
    fn role_gated_checks_role() {
        let gate = RoleGated::new("chat:read");
        let member = Identity::new("alice", vec!["chat:read".into()]);
        let stranger = Identity::new("mallory", vec!["other".into()]);

        assert!(gate.may_subscribe(&member, &ChannelId::from("c1")));
        assert!(!gate.may_subscribe(&stranger, &ChannelId::from("c1")));
    }
}
