//! # Index
//!
//! The Compass index manager: a flat vector store plus a SQLite metadata
//! store that always agree on which chunks are live.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        IndexManager                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  upsert / sync_file / remove / query / compact                  │
//! │        │                                   │                    │
//! │        ▼                                   ▼                    │
//! │  VectorStore (vectors.bin)         MetadataStore (compass.db)   │
//! │  slots + tombstones                files, chunks, index_entries,│
//! │                                    symbols, snapshot, meta      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Deletions are tombstones; [`IndexManager::compact`] drops them once the
//! tombstone ratio passes [`IndexConfig::compaction_threshold`].

pub mod config;
pub mod entry;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod vector;

pub use config::{DEFAULT_COMPACTION_THRESHOLD, IndexConfig};
pub use entry::{IndexEntry, QueryFilters, SearchHit, path_has_prefix, relative_path};
pub use error::{IndexError, Result};
pub use manager::{CompactStats, IndexManager, IndexStatus, OpenReport, UpsertStats};
pub use metadata::{EntryCounts, MetadataStore};
pub use vector::{FORMAT_VERSION, Slot, VectorStore};
