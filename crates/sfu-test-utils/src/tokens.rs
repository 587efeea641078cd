//! Token builders for auth scenarios.
//!
//! Wraps [`common::jwt`] with a fluent builder so tests read as intent:
//!
//! ```rust
//! use sfu_test_utils::tokens::TokenBuilder;
//!
//! let token = TokenBuilder::new()
//!     .session_id("alice")
//!     .issuer("test-suite")
//!     .build();
//! ```

use common::jwt::{sign, Claims, HS256};
use std::collections::HashMap;
use uuid::Uuid;

/// The default test key, decoded ("test-auth-key-123456").
#[must_use]
pub fn test_key() -> Vec<u8> {
    b"test-auth-key-123456".to_vec()
}

/// The default test key as base64, for `AUTH_KEY`.
pub const TEST_KEY_B64: &str = "dGVzdC1hdXRoLWtleS0xMjM0NTY=";

/// Fluent claims/token builder.
pub struct TokenBuilder {
    claims: Claims,
    key: Vec<u8>,
}

impl Default for TokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBuilder {
    /// A builder with one hour of validity and the default test key.
    #[must_use]
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            claims: Claims {
                exp: Some(now + 3600),
                iat: Some(now),
                ..Claims::default()
            },
            key: test_key(),
        }
    }

    /// Sign with a different key (e.g. a per-channel key).
    #[must_use]
    pub fn key(mut self, key: &[u8]) -> Self {
        self.key = key.to_vec();
        self
    }

    #[must_use]
    pub fn session_id(mut self, session_id: &str) -> Self {
        self.claims.session_id = Some(session_id.to_string());
        self
    }

    #[must_use]
    pub fn issuer(mut self, issuer: &str) -> Self {
        self.claims.iss = Some(issuer.to_string());
        self
    }

    /// Legacy channel binding claim.
    #[must_use]
    pub fn channel_uuid(mut self, uuid: Uuid) -> Self {
        self.claims.sfu_channel_uuid = Some(uuid);
        self
    }

    /// Per-channel key claim (stored base64-encoded).
    #[must_use]
    pub fn channel_key(mut self, key: &[u8]) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine};
        self.claims.key = Some(STANDARD.encode(key));
        self
    }

    /// Forced-disconnect claim.
    #[must_use]
    pub fn sessions_by_channel(mut self, uuid: Uuid, session_ids: &[&str]) -> Self {
        let entry = session_ids.iter().map(ToString::to_string).collect();
        self.claims
            .session_ids_by_channel
            .get_or_insert_with(HashMap::new)
            .insert(uuid, entry);
        self
    }

    /// Make the token already expired.
    #[must_use]
    pub fn expired(mut self) -> Self {
        let now = chrono::Utc::now().timestamp();
        self.claims.exp = Some(now - 60);
        self.claims.iat = Some(now - 120);
        self
    }

    /// Make the token not valid yet.
    #[must_use]
    pub fn not_yet_valid(mut self) -> Self {
        self.claims.nbf = Some(chrono::Utc::now().timestamp() + 3600);
        self
    }

    /// Sign the claims.
    #[must_use]
    pub fn build(self) -> String {
        sign(&self.claims, &self.key, HS256).expect("token signing")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::jwt::{verify, AuthError};

    #[test]
    fn test_default_token_verifies() {
        let token = TokenBuilder::new().session_id("alice").build();
        let claims = verify(&token, &test_key()).unwrap();
        assert_eq!(claims.session_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = TokenBuilder::new().expired().build();
        assert_eq!(verify(&token, &test_key()), Err(AuthError::Expired));
    }

    #[test]
    fn test_custom_key_token() {
        let token = TokenBuilder::new()
            .key(b"channel-secret")
            .session_id("bob")
            .build();

        assert!(verify(&token, b"channel-secret").is_ok());
        assert_eq!(
            verify(&token, &test_key()),
            Err(AuthError::InvalidSignature)
        );
    }
}
