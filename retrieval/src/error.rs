//! Error types for the Compass engine.

use compass_change_detector::ScanError;
use compass_embeddings::EmbeddingError;
use compass_index::IndexError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur in the engine.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Bad caller input: empty query, malformed path, unsupported content.
    #[error("invalid input: {0}")]
    Input(String),

    /// The embedding provider failed after retries.
    #[error("embedding provider error: {0}")]
    Provider(#[from] EmbeddingError),

    /// The vector and metadata stores disagree.
    #[error("index consistency error: {0}")]
    Consistency(String),

    /// Persisted index state is unreadable or incompatible.
    #[error("index corrupted: {0}")]
    Corruption(String),

    /// Another build holds the writer lock.
    #[error("an index build is already in progress")]
    BuildInProgress,

    /// A path filter points outside the configured roots.
    #[error("Access denied")]
    AccessDenied,

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Any other index failure.
    #[error("index error: {0}")]
    Index(IndexError),

    /// An index root could not be scanned.
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<IndexError> for RetrievalError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Consistency(message) => Self::Consistency(message),
            IndexError::Corruption(message) => Self::Corruption(message),
            other => Self::Index(other),
        }
    }
}
