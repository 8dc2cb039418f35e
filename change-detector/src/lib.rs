//! # Change Detector
//!
//! This crate tracks which files changed between two index builds.
//!
//! ## Features
//!
//! - **Content-addressed tree**: A Merkle tree over every indexed file
//! - **Minimal diffs**: Only subtrees whose hash differs are visited
//! - **Atomic snapshots**: The committed snapshot is swapped in one step
//! - **Default scanner**: A `walkdir` based scanner producing file records
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Change Detector                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  FsScanner ──► FileRecord ──► MerkleTree ──► ChangeSet          │
//! │      │                            │              │              │
//! │      ▼                            ▼              ▼              │
//! │  ScanConfig                   Snapshot ◄── ChangeDetector       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The detector never touches the file system itself: it consumes
//! [`FileRecord`]s produced by a [`Scanner`].

pub mod config;
pub mod error;
pub mod language;
pub mod merkle;
pub mod record;
pub mod scanner;
pub mod snapshot;

pub use config::ScanConfig;
pub use error::{Result, ScanError};
pub use language::Language;
pub use merkle::{ChangeSet, MerkleHash, MerkleNode, MerkleTree, hex};
pub use record::{FileRecord, content_hash, path_key};
pub use scanner::{
    FsScanner, ScanReport, Scanner, SkipReason, SkippedFile, canonical_root, is_binary,
};
pub use snapshot::{ChangeDetector, PendingSnapshot, Snapshot};
