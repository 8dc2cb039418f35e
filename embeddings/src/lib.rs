//! # Embeddings
//!
//! Turns chunk and query text into dense vectors for the Compass index.
//!
//! ## Features
//!
//! - **Provider contract**: [`EmbeddingProvider`] with Ollama and OpenAI-compatible HTTP clients
//! - **Worker pool**: bounded concurrency with order-preserving results
//! - **Retries**: exponential backoff for transient failures only
//! - **Caching**: query embeddings keyed by model and text
//!
//! ```text
//! EmbeddingRequest ──► EmbeddingPool ──► RetryPolicy ──► EmbeddingProvider
//!                           │
//!                           └──► EmbeddingCache (queries)
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod pool;
pub mod provider;
pub mod retry;
pub mod similarity;

pub use cache::{CacheStats, EmbeddingCache};
pub use config::{EmbeddingConfig, ProviderKind};
pub use error::{EmbeddingError, Result};
pub use pool::EmbeddingPool;
pub use provider::{
    EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, OllamaProvider, OpenAIProvider,
};
pub use retry::RetryPolicy;
pub use similarity::{cosine_similarity, dot_product, normalize, top_k};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Dimension produced by the default Ollama model (`nomic-embed-text`).
pub const DEFAULT_DIMENSION: usize = 768;
