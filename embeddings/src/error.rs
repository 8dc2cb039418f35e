//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    /// Provider not configured.
    #[error("embedding provider not configured")]
    ProviderNotConfigured,

    /// The provider could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider did not answer in time.
    #[error("provider timed out: {0}")]
    Timeout(String),

    /// The provider answered with something that is not an embedding.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The provider failed with a server error.
    #[error("provider error {status}: {message}")]
    Server { status: u16, message: String },

    /// The provider refused the request.
    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Nothing to embed.
    #[error("empty input")]
    EmptyInput,
}

impl EmbeddingError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::RateLimited { .. } | Self::Server { .. }
        )
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EmbeddingError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EmbeddingError::Timeout("slow".into()).is_transient());
        assert!(EmbeddingError::Unavailable("down".into()).is_transient());
        assert!(EmbeddingError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(
            EmbeddingError::Server {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!EmbeddingError::MalformedResponse("x".into()).is_transient());
        assert!(
            !EmbeddingError::Rejected {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
    }
}
