//! Error types for the index.

use thiserror::Error;

/// Errors raised by the vector store, the metadata store or the manager.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The two stores disagree.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Persisted state is unreadable or incompatible.
    #[error("corrupt index: {0}")]
    Corruption(String),

    /// A vector does not match the index dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The caller passed entries and vectors that do not line up.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// Whether the error means persisted state must be rebuilt.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}

/// Result type for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;
