//! Token validation seams and implementations.

use crate::errors::AuthError;
use async_trait::async_trait;
use banter_core::Identity;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;

/// Verifies a bearer credential and extracts the identity behind it.
///
/// Async because deployments may back this with a remote validation
/// service; the shipped implementations are purely local.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Verify `token` and return the identity it proves.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// JWT (HS256)
// ─────────────────────────────────────────────────────────────────────────────

/// Claims this layer reads from a platform-issued JWT.
#[derive(Debug, Deserialize)]
struct Claims {
    /// Subject — the stable user id.
    sub: String,
    /// Role strings granted by the issuer.
    #[serde(default)]
    roles: Vec<String>,
    /// Expiry, seconds since epoch. Checked by `jsonwebtoken`.
    #[allow(dead_code)]
    exp: usize,
}

/// Validates HS256 JWTs minted by the platform's auth service.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Build a validator over a shared HS256 secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(Identity::new(data.claims.sub, data.claims.roles))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Static map (dev / tests)
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed token → identity map. No expiry, no crypto; dev and tests only.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenValidator {
    /// Empty validator; rejects everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token and the identity it proves.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        let _ = self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".to_owned()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use jsonwebtoken::{EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        roles: Vec<String>,
        exp: usize,
    }

    fn mint(secret: &str, sub: &str, roles: &[&str], exp_offset_secs: i64) -> String {
        let exp = usize::try_from(chrono::Utc::now().timestamp() + exp_offset_secs).unwrap();
        let claims = TestClaims {
            sub: sub.to_owned(),
            roles: roles.iter().map(ToString::to_string).collect(),
            exp,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn jwt_valid_token_yields_identity() {
        let validator = JwtValidator::new("s3cret");
        let token = mint("s3cret", "alice", &["member", "admin"], 3600);

        let identity = validator.verify(&token).await.unwrap();
        assert_eq!(identity.user_id.as_str(), "alice");
        assert!(identity.has_role("admin"));
    }

    #[tokio::test]
    async fn jwt_missing_roles_claim_defaults_empty() {
        #[derive(Serialize)]
        struct Bare {
            sub: String,
            exp: usize,
        }
        let exp = usize::try_from(chrono::Utc::now().timestamp() + 600).unwrap();
        let token = jsonwebtoken::encode(
            &Header::default(),
            &Bare {
                sub: "bob".into(),
                exp,
            },
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();

        let validator = JwtValidator::new("s3cret");
        let identity = validator.verify(&token).await.unwrap();
        assert!(identity.roles.is_empty());
    }

    #[tokio::test]
    async fn jwt_expired_token_rejected() {
        let validator = JwtValidator::new("s3cret");
        // Well past the default leeway.
        let token = mint("s3cret", "alice", &[], -3600);

        let err = validator.verify(&token).await.unwrap_err();
        assert_matches!(err, AuthError::Expired);
    }

    #[tokio::test]
    async fn jwt_wrong_secret_rejected() {
        let validator = JwtValidator::new("s3cret");
        let token = mint("other-secret", "alice", &[], 3600);

        let err = validator.verify(&token).await.unwrap_err();
        assert_matches!(err, AuthError::Invalid(_));
    }

    #[tokio::test]
    async fn jwt_garbage_rejected_as_malformed() {
        let validator = JwtValidator::new("s3cret");
        let err = validator.verify("not-a-jwt").await.unwrap_err();
        assert_matches!(err, AuthError::Malformed(_));
    }

    #[tokio::test]
    async fn empty_token_is_missing_credential() {
        let validator = JwtValidator::new("s3cret");
        let err = validator.verify("").await.unwrap_err();
        assert_matches!(err, AuthError::MissingCredential);
    }

    #[tokio::test]
    async fn static_validator_known_and_unknown() {
        let validator = StaticTokenValidator::new()
            .with_token("tok-alice", Identity::new("alice", vec!["member".into()]));

        let identity = validator.verify("tok-alice").await.unwrap();
        assert_eq!(identity.user_id.as_str(), "alice");

        let err = validator.verify("tok-mallory").await.unwrap_err();
        assert_matches!(err, AuthError::Invalid(_));
    }
}
