//! # Compass Engine
//!
//! This crate ties the Compass components into one engine handle:
//!
//! - **Builds**: scan, diff, chunk, embed and apply, one file at a time
//! - **Semantic search**: nearest neighbors re-ranked with lexical overlap
//! - **Explanations**: typed reasons and a summary for every result
//! - **Quick lookup**: filename and symbol matches without embeddings
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        CompassEngine                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  Scanner ──► ChangeDetector ──► Chunker ──► EmbeddingPool       │
//! │                    │                             │              │
//! │                    ▼                             ▼              │
//! │              QuickIndex                    IndexManager         │
//! │                    │                             │              │
//! │                    ▼                             ▼              │
//! │              quick_lookup                 search + rank         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use compass_retrieval::{CompassEngine, EngineConfig, SearchOptions};
//!
//! let config = EngineConfig::from_env().with_root("/work/repo");
//! let engine = CompassEngine::open(config).await?;
//!
//! let stats = engine.build_or_update_index(&[]).await?;
//! let results = engine
//!     .search("where are retries configured", SearchOptions::default().with_k(5))
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod explain;
pub mod quick_index;
pub mod search;

pub use config::{DEFAULT_MIN_RELEVANCE, EngineConfig, SearchConfig};
pub use engine::{BuildStats, CompassEngine, EngineStatus};
pub use error::{Result, RetrievalError};
pub use explain::{Explanation, MatchReason, Strength, explain};
pub use quick_index::{LookupOptions, MatchKind, QuickIndex, QuickMatch};
pub use search::{SearchOptions, SearchResult, query_terms, rank};

// Re-export from dependencies for convenience
pub use compass_change_detector::{Language, ScanConfig};
pub use compass_chunker::{ChunkKind, ChunkerConfig};
pub use compass_embeddings::{EmbeddingConfig, EmbeddingProvider, RetryPolicy};
pub use compass_index::{CompactStats, IndexConfig, IndexEntry, QueryFilters};
