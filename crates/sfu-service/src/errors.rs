//! Service error types.
//!
//! All errors map to appropriate HTTP status codes via the `IntoResponse`
//! impl; errors reaching a duplex link are mapped to close codes by the
//! session close-reason machinery instead. Messages returned to clients are
//! intentionally generic; details are logged server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::jwt::AuthError;
use serde::Serialize;
use thiserror::Error;

use crate::bus::BusError;
use crate::media::MediaError;

/// Control-plane error type.
///
/// Maps to HTTP status codes:
/// - `Authentication`: 401 Unauthorized
/// - `MissingIssuer`: 403 Forbidden
/// - `UnknownChannel`: treated as unauthorized access, 401
/// - `Overcrowded`: 503 Service Unavailable
/// - `Unprocessable`: 422 Unprocessable Entity
/// - Config, Media, Bus, Internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum SfuError {
    /// Token verification failed.
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// The channel-create token carries no `iss` claim.
    #[error("Token has no issuer")]
    MissingIssuer,

    /// Channel uuid is not registered. Deliberately indistinguishable from
    /// an authentication failure on the wire.
    #[error("Unknown channel")]
    UnknownChannel,

    /// Channel is at capacity.
    #[error("Channel is full")]
    Overcrowded,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error raised by the media engine.
    #[error("Media error: {0}")]
    Media(String),

    /// Bus-level failure (request timeout, bus closed).
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Request body or claims cannot be processed.
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MediaError> for SfuError {
    fn from(err: MediaError) -> Self {
        SfuError::Media(err.to_string())
    }
}

impl SfuError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            SfuError::Authentication(_) | SfuError::UnknownChannel => StatusCode::UNAUTHORIZED,
            SfuError::MissingIssuer => StatusCode::FORBIDDEN,
            SfuError::Overcrowded => StatusCode::SERVICE_UNAVAILABLE,
            SfuError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SfuError::Config(_)
            | SfuError::Media(_)
            | SfuError::Bus(_)
            | SfuError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for SfuError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            SfuError::Authentication(_) | SfuError::UnknownChannel => {
                "Authentication failed".to_string()
            }
            SfuError::MissingIssuer => "Token has no issuer".to_string(),
            SfuError::Overcrowded => "Channel is full".to_string(),
            SfuError::Unprocessable(reason) => reason.clone(),
            SfuError::Config(detail)
            | SfuError::Media(detail)
            | SfuError::Internal(detail) => {
                tracing::error!(target: "sfu.http", error = %detail, "Request failed");
                "An internal error occurred".to_string()
            }
            SfuError::Bus(err) => {
                tracing::error!(target: "sfu.http", error = %err, "Request failed");
                "An internal error occurred".to_string()
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            SfuError::Authentication(AuthError::InvalidSignature).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SfuError::UnknownChannel.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(SfuError::MissingIssuer.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            SfuError::Overcrowded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SfuError::Unprocessable("bad".to_string()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            SfuError::Config("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            SfuError::Media("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_messages_hide_details() {
        let err = SfuError::Media("transport closed at 10.0.0.5".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
