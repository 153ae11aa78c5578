//! Error taxonomy shared by every component
//!
//! Each variant knows whether it is retryable and which category it is
//! reported under, so callers and the error sink get structured information
//! rather than strings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Common result type for sync core operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures of the durable key-value store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on key {key}: {message}")]
    Io { key: String, message: String },

    #[error("Failed to encode or decode record {key}: {message}")]
    Codec { key: String, message: String },

    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StoreError::Io {
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn codec(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StoreError::Codec {
            key: key.into(),
            message: err.to_string(),
        }
    }
}

/// Errors surfaced by the sync core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Network-level failure; retried per the retry policy
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// An attempt exceeded its time budget; treated as transient
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The backend rejected the request; never retried
    #[error("Validation rejected: {0}")]
    PermanentValidation(String),

    /// Credentials expired; refresh then retry once
    #[error("Authentication expired")]
    AuthExpired,

    /// Credentials were permanently refused
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Client-side rate limit hit before any network attempt
    #[error("Rate limit exceeded for {scope}, resets in {reset_in_ms} ms")]
    RateLimitExceeded { scope: String, reset_in_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A realtime channel gave up reconnecting
    #[error("Reconnect attempts exhausted for channel {channel} after {attempts} attempts")]
    ReconnectExhausted { channel: String, attempts: u32 },

    /// The session could not be refreshed and requires a new sign-in
    #[error("Session expired, re-authentication required")]
    SessionExpired,

    #[error("No active session")]
    NoSession,

    #[error("Operation not found: {0}")]
    NotFound(String),

    /// A joined in-flight operation was abandoned by its leader
    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the retry engine should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_) | SyncError::Timeout(_))
    }

    /// Category used when reporting to the error sink
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::TransientNetwork(_) | SyncError::Timeout(_) => {
                ErrorCategory::TransientNetwork
            }
            SyncError::PermanentValidation(_) | SyncError::NotFound(_) => {
                ErrorCategory::PermanentValidation
            }
            SyncError::AuthExpired
            | SyncError::AuthRejected(_)
            | SyncError::SessionExpired
            | SyncError::NoSession => ErrorCategory::AuthExpired,
            SyncError::RateLimitExceeded { .. } => ErrorCategory::RateLimitExceeded,
            SyncError::Storage(_) => ErrorCategory::Storage,
            SyncError::ReconnectExhausted { .. } => ErrorCategory::ReconnectExhausted,
            SyncError::Cancelled => ErrorCategory::Cancelled,
        }
    }
}

/// Error categories reported to the error sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TransientNetwork,
    PermanentValidation,
    AuthExpired,
    RateLimitExceeded,
    Storage,
    ReconnectExhausted,
    Cancelled,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::TransientNetwork => "transient_network",
            ErrorCategory::PermanentValidation => "permanent_validation",
            ErrorCategory::AuthExpired => "auth_expired",
            ErrorCategory::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCategory::Storage => "storage",
            ErrorCategory::ReconnectExhausted => "reconnect_exhausted",
            ErrorCategory::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}
