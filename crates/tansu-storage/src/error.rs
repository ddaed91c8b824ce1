//! Storage error types.

use thiserror::Error;

/// Domain error for every storage operation.
///
/// Driver-level failures are never swallowed: they travel through the
/// dispatcher, the gateway and the recursive library unchanged, and only the
/// outermost protocol adapter translates them into wire status codes.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend exists but is not ready to serve (no media, not mounted).
    #[error("storage not ready")]
    NotReady,

    /// Path already exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// Path does not exist.
    #[error("does not exist: {0}")]
    NotExists(String),

    /// An argument was out of range or referenced a dead handle.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The backend refused the operation (e.g. removing a non-empty
    /// directory, writing through a read-only handle).
    #[error("access denied: {0}")]
    Denied(String),

    /// The path does not start with a routable prefix.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Backend-internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The backend does not implement this operation.
    #[error("not implemented")]
    NotImplemented,

    /// Another live handle already references this path.
    #[error("already open: {0}")]
    AlreadyOpen(String),
}

impl StorageError {
    /// Create an Exists error.
    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists(path.into())
    }

    /// Create a NotExists error.
    pub fn not_exists(path: impl Into<String>) -> Self {
        Self::NotExists(path.into())
    }

    /// Create a Denied error.
    pub fn denied(msg: impl Into<String>) -> Self {
        Self::Denied(msg.into())
    }

    /// Create an InvalidName error.
    pub fn invalid_name(path: impl Into<String>) -> Self {
        Self::InvalidName(path.into())
    }

    /// Create an Internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an AlreadyOpen error.
    pub fn already_open(path: impl Into<String>) -> Self {
        Self::AlreadyOpen(path.into())
    }
}

/// Storage result type.
pub type StorageResult<T> = Result<T, StorageError>;
