//! State store error types

use thiserror::Error;

/// Errors surfaced by the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Execution is unknown to both cache and database.
    #[error("execution not found: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Persisted state could not be decoded.
    #[error("corrupt state for execution {execution_id}: {detail}")]
    Corrupt {
        execution_id: String,
        detail: String,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateStoreError::NotFound(_))
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;
