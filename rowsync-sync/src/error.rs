//! Error types for the sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error (connection refused, reset, DNS, ...).
    #[error("network error: {0}")]
    Network(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The remote service failed (5xx).
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The remote service rejected the request (4xx other than 401/403).
    #[error("API request failed ({status}): {message}")]
    Api { status: u16, message: String },

    /// The authenticated user may not access the resource (403).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The local row source failed.
    #[error("source error: {0}")]
    Source(String),

    /// Local database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Local file error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encryption error.
    #[error("crypto error: {0}")]
    Crypto(#[from] rowsync_crypto::CryptoError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A commit kept failing until the retry bound was reached.
    #[error("commit failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },

    /// A pending commit retry was cancelled by a newer run.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Maps an unsuccessful HTTP status to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => SyncError::Auth(message),
            403 => SyncError::PermissionDenied(message),
            500..=599 => SyncError::Server { status, message },
            _ => SyncError::Api { status, message },
        }
    }

    /// Returns true if repeating the request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::Timeout
                | SyncError::Server { .. }
                | SyncError::Api { status: 429, .. }
        )
    }

    /// Returns true if the error means the credentials are not accepted.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            SyncError::Auth(_) => true,
            SyncError::RetriesExhausted { last, .. } => last.is_auth_failure(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout
        } else if let Some(status) = e.status() {
            SyncError::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            SyncError::Api {
                status: 200,
                message: format!("unexpected response body: {e}"),
            }
        } else {
            SyncError::Network(e.to_string())
        }
    }
}
