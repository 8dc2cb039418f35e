//! Error types for change detection and scanning.

use thiserror::Error;

/// Result type alias for change detector operations.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Errors that can occur while scanning index roots.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Index root not found.
    #[error("directory not found: {0}")]
    RootNotFound(String),

    /// Index root exists but is a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Invalid exclude pattern.
    #[error("invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
