//! Error types for DocVault
//!
//! Read-path absence is never an error: lookups return `Option`. These
//! variants cover the write path, startup, and configuration.

use thiserror::Error;

/// Common result type for DocVault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for DocVault
#[derive(Debug, Error)]
pub enum Error {
    // Locking
    #[error("timed out after {waited_ms} ms waiting for lock {path}")]
    LockTimeout { path: String, waited_ms: u64 },

    // Caller errors, rejected before any disk mutation
    #[error("record already exists: {0}")]
    DuplicateKey(String),

    #[error("invalid record key: {0}")]
    InvalidKey(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the caller may simply retry the operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Check if this error was caused by caller input rather than the store
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateKey(_)
                | Self::InvalidKey(_)
                | Self::InvalidRecord(_)
                | Self::InvalidArgument(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
