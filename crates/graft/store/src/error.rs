//! Error types shared by every store backend.

use thiserror::Error;

/// Convenience alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the mirror store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("record already exists: {0}")]
    Conflict(String),

    /// The caller supplied a value the store cannot accept.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The underlying backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True when the error is a missing-record error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// True when the error is a uniqueness conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
