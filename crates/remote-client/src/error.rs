//! Error types for the remote client crate.

use thiserror::Error;
use todosync_core::errors::{classify_http_status, Error as CoreError, SyncRetryClass};

/// Result type alias for remote client operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors that can occur talking to the record service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error response from the record service
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Realtime socket failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid request (bad URL, missing data)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The health route answered but did not report the service as up
    #[error("Service unhealthy: {0}")]
    Unhealthy(String),
}

impl RemoteError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(_) | Self::Json(_) | Self::WebSocket(_) | Self::Unhealthy(_) => {
                SyncRetryClass::Retryable
            }
            Self::InvalidRequest(_) => SyncRetryClass::Permanent,
        }
    }
}

impl From<RemoteError> for CoreError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Http(err) if err.is_timeout() => {
                CoreError::RemoteUnreachable(format!("request timed out: {}", err))
            }
            RemoteError::Http(err) if err.is_connect() || err.is_request() => {
                CoreError::NetworkUnavailable(err.to_string())
            }
            RemoteError::Http(err) => CoreError::RemoteUnreachable(err.to_string()),
            // A 2xx body we cannot read usually comes from something in front
            // of the service (captive portal, proxy error page).
            RemoteError::Json(err) => {
                CoreError::RemoteUnreachable(format!("unexpected response body: {}", err))
            }
            RemoteError::Api { status, message } => CoreError::from_http_status(status, message),
            RemoteError::WebSocket(message) => CoreError::NetworkUnavailable(message),
            RemoteError::InvalidRequest(message) => CoreError::InvalidItem(message),
            RemoteError::Unhealthy(message) => CoreError::RemoteUnreachable(message),
        }
    }
}
