//! Signal hub error types.
//!
//! Errors map to client-safe [`ErrorCode`] values; internal detail is logged
//! server-side and never sent over the wire.

use signal_protocol::ErrorCode;
use thiserror::Error;

/// Signal hub error type.
#[derive(Debug, Error)]
pub enum HubError {
    /// Credential verification failed.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The registry or a session actor is gone (shutdown or crash).
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Session not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The service is draining and not accepting new work.
    #[error("service is draining")]
    Draining,
}

impl HubError {
    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HubError::AuthenticationFailed => ErrorCode::AuthenticationFailed,
            HubError::Config(_)
            | HubError::RegistryUnavailable(_)
            | HubError::SessionNotFound(_)
            | HubError::Draining => ErrorCode::Internal,
        }
    }

    /// Returns a client-safe message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            HubError::AuthenticationFailed => "Invalid or expired credential".to_string(),
            HubError::Draining => "Server is shutting down, please reconnect".to_string(),
            HubError::Config(_) | HubError::RegistryUnavailable(_) | HubError::SessionNotFound(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}
