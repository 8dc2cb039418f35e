//! Error types for chunking.

use thiserror::Error;

/// Result type alias for chunker operations.
pub type Result<T> = std::result::Result<T, ChunkError>;

/// Errors that can occur while chunking a file.
#[derive(Error, Debug)]
pub enum ChunkError {
    /// Binary or non UTF-8 content.
    #[error("unsupported content: {0}")]
    Unsupported(String),

    /// The structural parser could not produce a usable tree.
    #[error("parse failed: {0}")]
    Parse(String),

    /// The grammar could not be loaded.
    #[error("grammar error: {0}")]
    Grammar(String),
}
