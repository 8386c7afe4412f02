//! Credential verification.
//!
//! Connections present an opaque credential string in their Hello frame.
//! Two forms are accepted: a signed HS256 bearer token carrying the user's
//! numeric identity, and a reserved guest sentinel that binds the fixed
//! guest identity without signature verification. Guest access is gated by
//! configuration and logged loudly; it exists for local development only.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Reserved credential string that authenticates as the guest identity.
pub const GUEST_SENTINEL: &str = "guest_token";

/// Fixed user identity bound to guest connections.
pub const GUEST_USER_ID: u64 = 0;

/// Signed token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    /// Numeric user identity.
    id: u64,
    /// Expiry, unix seconds.
    exp: u64,
}

/// Verified identity extracted from a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthClaims {
    /// Authenticated user identity.
    pub user_id: u64,
    /// True when the guest sentinel was used.
    pub guest: bool,
}

/// Credential verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Signature invalid, malformed token, or wrong algorithm
    #[error("invalid credential")]
    InvalidToken,

    /// Token was valid but has expired
    #[error("credential expired")]
    Expired,

    /// Guest sentinel presented but guest access is disabled
    #[error("guest access is disabled")]
    GuestDisabled,
}

/// Verifies bearer credentials against a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    allow_guest: bool,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").field("allow_guest", &self.allow_guest).finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Create a verifier for HS256 tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8], allow_guest: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self { decoding_key: DecodingKey::from_secret(secret), validation, allow_guest }
    }

    /// Verify a credential and extract the identity it binds.
    ///
    /// The guest sentinel is checked before signature verification: it is
    /// not a token and never parses as one.
    ///
    /// # Errors
    ///
    /// - `AuthError::GuestDisabled` if the sentinel is presented while guest
    ///   access is off
    /// - `AuthError::Expired` if the token's `exp` has passed
    /// - `AuthError::InvalidToken` for any other verification failure
    pub fn verify(&self, credential: &str) -> Result<AuthClaims, AuthError> {
        if credential == GUEST_SENTINEL {
            if !self.allow_guest {
                return Err(AuthError::GuestDisabled);
            }

            warn!(
                user_id = GUEST_USER_ID,
                "guest sentinel accepted; guest access is not safe for production"
            );
            return Ok(AuthClaims { user_id: GUEST_USER_ID, guest: true });
        }

        let data = jsonwebtoken::decode::<Claims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            })?;

        Ok(AuthClaims { user_id: data.claims.id, guest: false })
    }
}

/// Sign a bearer token for `user_id`, expiring at `expires_at` (unix
/// seconds).
///
/// Token issuance lives with account management, not this subsystem; this
/// helper exists for tooling and tests that need valid credentials.
///
/// # Errors
///
/// Returns `AuthError::InvalidToken` if signing fails (malformed key).
pub fn sign_token(secret: &[u8], user_id: u64, expires_at: u64) -> Result<String, AuthError> {
    let claims = Claims { id: user_id, exp: expires_at };

    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret))
        .map_err(|_| AuthError::InvalidToken)
}
