//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use them for all
//! sensitive values: the global verification key, per-channel keys, and any
//! token material held in memory.
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so any
//! struct that derives `Debug` while holding one of these cannot leak the
//! value through `{:?}` or tracing fields. Secrets are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct AuthConfig {
//!     issuer: String,
//!     key: SecretString,
//! }
//!
//! let config = AuthConfig {
//!     issuer: "control".to_string(),
//!     key: SecretString::from("hunter2"),
//! };
//!
//! // Debug output redacts the key
//! assert!(!format!("{config:?}").contains("hunter2"));
//!
//! // Access requires an explicit call
//! let raw: &str = config.key.expose_secret();
//! # let _ = raw;
//! ```
//!
//! Use `SecretString` for base64-encoded keys arriving through the
//! environment, and `SecretBox<Vec<u8>>` for decoded key bytes.

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("password123");
        assert_eq!(secret.expose_secret(), "password123");
    }

    #[test]
    fn test_secret_box_bytes() {
        let key = SecretBox::new(Box::new(vec![7u8; 32]));
        assert_eq!(key.expose_secret().len(), 32);
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
