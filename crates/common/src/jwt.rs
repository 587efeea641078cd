//! Signed bearer tokens binding a session to a channel.
//!
//! Tokens are compact JWS structures (`header.claims.signature`, each segment
//! base64url without padding) signed with HMAC-SHA256. Only HS256 is
//! accepted; the algorithm declared in the header is checked against the
//! allow-list before any signature work happens.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Signature comparison is constant-time ([`ring::hmac::verify`])
//! - Temporal claims are checked only after the signature holds, so error
//!   variants never reveal claim contents for forged tokens
//!
//! # Usage
//!
//! ```rust
//! use common::jwt::{sign, verify, Claims, HS256};
//!
//! let key = b"0123456789abcdef0123456789abcdef";
//! let claims = Claims {
//!     session_id: Some("alice".to_string()),
//!     ..Claims::default()
//! };
//!
//! let token = sign(&claims, key, HS256).unwrap();
//! let verified = verify(&token, key).unwrap();
//! assert_eq!(verified.session_id.as_deref(), Some("alice"));
//! ```

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The one supported signing algorithm.
pub const HS256: &str = "HS256";

/// Maximum allowed token size in bytes (8KB).
///
/// Typical tokens are 200-500 bytes; anything larger is rejected before
/// base64 decoding or any cryptographic work happens.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// How far in the future an `iat` claim may sit before the token is
/// rejected as issued-in-the-future (clock drift allowance).
pub const IAT_FORWARD_SKEW_SECONDS: i64 = 60;

/// Token signing/verification failures.
///
/// Verification failures all carry a distinct cause but are surfaced to
/// clients uniformly as an authentication failure; the variant is for
/// server-side logs and tests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No signing key configured.
    #[error("signing key is missing")]
    MissingKey,

    /// The requested or declared algorithm is not HS256.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Token exceeds [`MAX_TOKEN_SIZE_BYTES`].
    #[error("token too large")]
    TokenTooLarge,

    /// Token is not `header.claims.signature`, or a segment fails to decode.
    #[error("malformed token")]
    Malformed,

    /// Recomputed signature does not match.
    #[error("invalid signature")]
    InvalidSignature,

    /// `exp` is in the past.
    #[error("token expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("token not yet valid")]
    NotYetValid,

    /// `iat` is more than [`IAT_FORWARD_SKEW_SECONDS`] in the future.
    #[error("token issued in the future")]
    IssuedInFuture,
}

/// Token claims recognised by the control plane.
///
/// Registered temporal claims plus the private claims the gateway and HTTP
/// API consume. Unknown claims are ignored on decode and never round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Expiration timestamp (Unix epoch seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Not-before timestamp (Unix epoch seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Issuer, used for idempotent channel creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Legacy binding of a token to a channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sfu_channel_uuid: Option<Uuid>,

    /// Session id the bearer will join as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// ICE server list passed through to the client untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<serde_json::Value>,

    /// Base64-encoded per-channel verification key, installed on channel
    /// creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Sessions to force-disconnect, keyed by channel uuid.
    #[serde(
        rename = "sessionIdsByChannel",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_ids_by_channel: Option<HashMap<Uuid, Vec<String>>>,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Sign `claims` with `key` using `algorithm`.
///
/// # Errors
///
/// - [`AuthError::MissingKey`] when `key` is empty
/// - [`AuthError::UnsupportedAlgorithm`] for anything but `HS256`
pub fn sign(claims: &Claims, key: &[u8], algorithm: &str) -> Result<String, AuthError> {
    if key.is_empty() {
        return Err(AuthError::MissingKey);
    }
    if algorithm != HS256 {
        return Err(AuthError::UnsupportedAlgorithm(algorithm.to_string()));
    }

    let header = Header {
        alg: HS256.to_string(),
        typ: "JWT".to_string(),
    };

    // Serializing locally-built structs cannot fail
    let header_json = serde_json::to_vec(&header).map_err(|_| AuthError::Malformed)?;
    let claims_json = serde_json::to_vec(claims).map_err(|_| AuthError::Malformed)?;

    let header_b64 = URL_SAFE_NO_PAD.encode(header_json);
    let claims_b64 = URL_SAFE_NO_PAD.encode(claims_json);
    let signed_data = format!("{header_b64}.{claims_b64}");

    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&hmac_key, signed_data.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(tag.as_ref());

    Ok(format!("{signed_data}.{signature_b64}"))
}

/// Verify `token` against `key` and return its claims.
///
/// The signature is recomputed over `header.claims` using the algorithm the
/// header declares (HS256 only) and compared in constant time. Temporal
/// claims are then checked against the current clock.
///
/// # Errors
///
/// Any [`AuthError`] verification variant; see the enum for causes.
pub fn verify(token: &str, key: &[u8]) -> Result<Claims, AuthError> {
    verify_at(token, key, chrono::Utc::now().timestamp())
}

/// Deterministic verification against an explicit `now` timestamp.
///
/// Prefer [`verify`] in production code. This variant exists so that
/// temporal boundaries can be unit-tested without wall-clock dependence.
pub fn verify_at(token: &str, key: &[u8], now: i64) -> Result<Claims, AuthError> {
    if key.is_empty() {
        return Err(AuthError::MissingKey);
    }
    if token.len() > MAX_TOKEN_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_TOKEN_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(AuthError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    let (header_b64, claims_b64, signature_b64) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s), None) => (h, c, s),
            _ => return Err(AuthError::Malformed),
        };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| AuthError::Malformed)?;
    let header: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| AuthError::Malformed)?;

    if header.alg != HS256 {
        tracing::debug!(
            target: "common.jwt",
            alg = %header.alg,
            "Token rejected: unsupported algorithm in header"
        );
        return Err(AuthError::UnsupportedAlgorithm(header.alg));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::Malformed)?;

    let signed_data = format!("{header_b64}.{claims_b64}");
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&hmac_key, signed_data.as_bytes(), &signature)
        .map_err(|_| AuthError::InvalidSignature)?;

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| AuthError::Malformed)?;
    let claims: Claims =
        serde_json::from_slice(&claims_bytes).map_err(|_| AuthError::Malformed)?;

    if let Some(exp) = claims.exp {
        if exp < now {
            return Err(AuthError::Expired);
        }
    }
    if let Some(nbf) = claims.nbf {
        if nbf > now {
            return Err(AuthError::NotYetValid);
        }
    }
    if let Some(iat) = claims.iat {
        if iat > now + IAT_FORWARD_SKEW_SECONDS {
            return Err(AuthError::IssuedInFuture);
        }
    }

    Ok(claims)
}
