//! Index entries and query filters.

use compass_change_detector::Language;
use compass_chunker::{Chunk, ChunkKind};
use serde::{Deserialize, Serialize};

/// Metadata for one indexed chunk.
///
/// The vector lives in the [`VectorStore`](crate::VectorStore) under the
/// same `chunk_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub path: String,
    pub sequence: u32,
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub language: Language,
    pub git_tracked: bool,
    pub start_line: usize,
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
    pub text: String,
    pub context: Option<String>,
}

impl IndexEntry {
    /// Entry for a freshly produced chunk.
    pub fn from_chunk(chunk: &Chunk, git_tracked: bool) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            path: chunk.path.clone(),
            sequence: chunk.sequence,
            kind: chunk.kind,
            name: chunk.name.clone(),
            language: chunk.language,
            git_tracked,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            start_byte: chunk.start_byte,
            end_byte: chunk.end_byte,
            text: chunk.text.clone(),
            context: chunk.context.clone(),
        }
    }

    /// File name component of the path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Restrictions applied to a nearest-neighbor query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    /// Only these languages (empty = any).
    pub languages: Vec<Language>,

    /// Only paths equal to or below this prefix.
    pub path_prefix: Option<String>,

    /// Only files inside a git working tree.
    pub git_only: bool,
}

impl QueryFilters {
    /// Whether no filter is set.
    pub fn is_empty(&self) -> bool {
        self.languages.is_empty() && self.path_prefix.is_none() && !self.git_only
    }

    pub fn with_languages(mut self, languages: Vec<Language>) -> Self {
        self.languages = languages;
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn with_git_only(mut self, git_only: bool) -> Self {
        self.git_only = git_only;
        self
    }

    /// Whether `entry` passes the filters.
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        if !self.languages.is_empty() && !self.languages.contains(&entry.language) {
            return false;
        }
        if self.git_only && !entry.git_tracked {
            return false;
        }
        match &self.path_prefix {
            Some(prefix) => path_has_prefix(&entry.path, prefix),
            None => true,
        }
    }
}

/// Whether `path` is `prefix` or lies below it, on component boundaries.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// `path` relative to the deepest of `roots` containing it.
///
/// Falls back to the file name when no root contains the path, so the
/// directories above an index root never take part in matching.
pub fn relative_path<'a>(path: &'a str, roots: &[String]) -> &'a str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    roots
        .iter()
        .map(|root| root.trim_end_matches('/'))
        .filter(|root| path_has_prefix(path, root))
        .max_by_key(|root| root.len())
        .and_then(|root| path.strip_prefix(root))
        .map(|rest| rest.trim_start_matches('/'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(file_name)
}

/// A query result: the entry and its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub entry: IndexEntry,
    pub similarity: f32,
}
