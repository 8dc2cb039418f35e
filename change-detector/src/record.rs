//! Scan records consumed by the change detector.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::language::Language;

/// A file as seen by one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute, `/`-separated path. Unique key of the record.
    pub path: String,

    /// SHA-256 of the file content, lowercase hex.
    pub content_hash: String,

    /// Size in bytes.
    pub size: u64,

    /// Last modification time reported by the file system.
    pub modified: DateTime<Utc>,

    /// Language inferred from the extension.
    pub language: Language,

    /// Whether the file lives inside a git working tree.
    #[serde(default)]
    pub git_tracked: bool,
}

impl FileRecord {
    /// Build a record from in-memory content.
    pub fn from_content(path: impl AsRef<Path>, content: &[u8], modified: DateTime<Utc>) -> Self {
        let path = path.as_ref();
        Self {
            path: path_key(path),
            content_hash: content_hash(content),
            size: content.len() as u64,
            modified,
            language: Language::from_path(path),
            git_tracked: false,
        }
    }

    /// Mark the record as git tracked.
    pub fn with_git_tracked(mut self, tracked: bool) -> Self {
        self.git_tracked = tracked;
        self
    }

    /// File name component of the path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// SHA-256 hex digest of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Normalize a path into the `/`-separated key used throughout the index.
pub fn path_key(path: &Path) -> String {
    let key = path.to_string_lossy().replace('\\', "/");
    if key.len() > 1 {
        key.trim_end_matches('/').to_string()
    } else {
        key
    }
}
