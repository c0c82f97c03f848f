//! Error types for session and presence operations.

use banter_cluster::ClusterError;
use banter_core::errors::codes;

/// Errors surfaced by the session registry and presence tracker.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The cluster bridge failed.
    #[error(transparent)]
    Bridge(#[from] ClusterError),

    /// A stored record could not be encoded or decoded.
    #[error("record serialization failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// An atomic update did not settle after bounded retries.
    #[error("registry update did not settle: {0}")]
    Unsettled(String),
}

impl RegistryError {
    /// Stable status code for client-facing reporting.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Bridge(inner) => inner.code(),
            Self::Codec(_) | Self::Unsettled(_) => codes::INTERNAL_ERROR,
        }
    }
}
