//! Auth error types.

use banter_core::codes;

/// Errors rejecting a bearer credential. Any variant aborts the handshake;
/// no connection is established.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("missing bearer credential")]
    MissingCredential,

    /// The credential could not be decoded at all.
    #[error("malformed credential: {0}")]
    Malformed(String),

    /// The credential's expiry has passed.
    #[error("credential expired")]
    Expired,

    /// Signature check or claim validation failed.
    #[error("credential rejected: {0}")]
    Invalid(String),
}

impl AuthError {
    /// Stable status code; every auth failure surfaces the same way.
    #[must_use]
    pub fn code(&self) -> &'static str {
        codes::AUTH_FAILED
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::Malformed(err.to_string()),
            _ => Self::Invalid(err.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
