//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Checkpoint not found
    #[error("Checkpoint not found")]
    NotFound,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Lock acquisition timed out
    #[error("Lock acquisition timed out for thread: {thread}")]
    LockTimeout { thread: String },

    /// Invalid checkpoint data or configuration
    #[error("Invalid checkpoint data: {0}")]
    Invalid(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CheckpointError {
    fn from(err: redis::RedisError) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}
