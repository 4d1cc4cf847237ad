//! Error types for the todo sync core.

use thiserror::Error;

/// Result type alias for sync core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRetryClass {
    /// Keep the action queued and retry on the next drain cycle.
    Retryable,
    /// Drop the action; retrying cannot succeed.
    Permanent,
}

/// Errors surfaced by the sync core and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// No transport to the remote service (offline, connection refused).
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Transport works but the record service is not answering properly.
    #[error("Remote service unreachable: {0}")]
    RemoteUnreachable(String),

    /// The record service answered with an application error.
    #[error("Remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// The mutation target does not exist remotely.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Item fields failed validation before reaching the engine.
    #[error("Invalid item: {0}")]
    InvalidItem(String),

    /// Local persistence failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization error. Retryable: an unreadable
    /// payload says nothing about whether the action itself is valid.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine task is no longer running.
    #[error("Sync engine stopped")]
    EngineStopped,
}

impl Error {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::RemoteRejected {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_item(message: impl Into<String>) -> Self {
        Self::InvalidItem(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Build the error matching an HTTP failure status.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 404 {
            return Self::NotFound(message);
        }
        match classify_http_status(status) {
            SyncRetryClass::Retryable => Self::RemoteUnreachable(format!("{status}: {message}")),
            SyncRetryClass::Permanent => Self::RemoteRejected { status, message },
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::NetworkUnavailable(_)
            | Self::RemoteUnreachable(_)
            | Self::Storage(_)
            | Self::Serialization(_) => SyncRetryClass::Retryable,
            Self::RemoteRejected { .. }
            | Self::NotFound(_)
            | Self::InvalidItem(_)
            | Self::EngineStopped => SyncRetryClass::Permanent,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        408 | 425 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}
