//! Configuration for the Compass engine.

use std::path::{Path, PathBuf};

use compass_change_detector::ScanConfig;
use compass_chunker::ChunkerConfig;
use compass_embeddings::EmbeddingConfig;
use compass_index::IndexConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrievalError};

/// Environment variable that overrides [`EngineConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "COMPASS_DATA_DIR";

/// SQLite metadata store file name.
pub const DB_FILE: &str = "compass.db";

/// Vector blob file name.
pub const VECTORS_FILE: &str = "vectors.bin";

/// Score below which search results are dropped unless a query overrides it.
pub const DEFAULT_MIN_RELEVANCE: f32 = 0.3;

/// Configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where the index files live.
    pub data_dir: PathBuf,

    /// Directories that may be indexed and searched.
    pub roots: Vec<PathBuf>,

    /// File-system scanning.
    pub scan: ScanConfig,

    /// Chunk sizes.
    pub chunker: ChunkerConfig,

    /// Index maintenance.
    pub index: IndexConfig,

    /// Query processing.
    pub search: SearchConfig,

    /// Embedding provider and worker pool.
    pub embedding: EmbeddingConfig,
}

impl EngineConfig {
    /// Create a configuration storing its index under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            roots: Vec::new(),
            scan: ScanConfig::default(),
            chunker: ChunkerConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }

    /// Default data directory: `~/.compass`.
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir().unwrap_or_default().join(".compass")
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| RetrievalError::Config(e.to_string()))
    }

    /// Load a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_toml_str(&source)?.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|dir| !dir.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        self
    }

    /// Add a root directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Set the scan configuration.
    pub fn with_scan(mut self, scan: ScanConfig) -> Self {
        self.scan = scan;
        self
    }

    /// Set the chunker configuration.
    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    /// Set the index configuration.
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = index;
        self
    }

    /// Set the search configuration.
    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    /// Set the embedding configuration.
    pub fn with_embedding(mut self, embedding: EmbeddingConfig) -> Self {
        self.embedding = embedding;
        self
    }

    /// Path of the SQLite metadata store.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    /// Path of the vector blob.
    pub fn vectors_path(&self) -> PathBuf {
        self.data_dir.join(VECTORS_FILE)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(Self::default_data_dir())
    }
}

/// Configuration for query processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates fetched per requested result before re-ranking.
    pub candidate_multiplier: usize,

    /// Weight for vector similarity.
    pub semantic_weight: f32,

    /// Weight for query-term overlap.
    pub lexical_weight: f32,

    /// Results scoring below this are dropped.
    pub min_relevance: f32,

    /// Upper bound for `k`.
    pub max_results: usize,

    /// `k` when the caller does not pass one.
    pub default_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_multiplier: 4,
            semantic_weight: 0.8,
            lexical_weight: 0.2,
            min_relevance: DEFAULT_MIN_RELEVANCE,
            max_results: 50,
            default_results: 10,
        }
    }
}
