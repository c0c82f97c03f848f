//! # banter-auth
//!
//! Bearer credential validation and channel authorization.
//!
//! This layer never mints credentials — it only verifies them and extracts
//! an [`banter_core::Identity`]:
//!
//! - **`TokenValidator`**: async seam for the validation service, with two
//!   shipped implementations — `JwtValidator` (HS256, `sub`/`roles`/`exp`
//!   claims) and `StaticTokenValidator` (fixed token map for dev and tests)
//! - **`ChannelAuthorizer`**: post-handshake channel subscription policy,
//!   driven by the identity's role strings

#![deny(unsafe_code)]

pub mod authorize;
pub mod errors;
pub mod validator;

pub use authorize::{AllowAuthenticated, ChannelAuthorizer, RoleGated};
pub use errors::AuthError;
pub use validator::{JwtValidator, StaticTokenValidator, TokenValidator};
