//! Configuration for scanning index roots.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Configuration for the default file-system scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Patterns to exclude (glob patterns).
    pub exclude_patterns: Vec<String>,

    /// Only index files with these extensions (None = any text file).
    pub extensions: Option<Vec<String>>,

    /// Files larger than this are skipped.
    pub max_file_size: u64,

    /// Maximum depth to recurse (None = unlimited).
    pub max_depth: Option<usize>,

    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,
}

impl ScanConfig {
    /// Create a scan config with the default excludes.
    pub fn new() -> Self {
        Self {
            exclude_patterns: Self::default_excludes(),
            extensions: None,
            max_file_size: 1024 * 1024,
            max_depth: None,
            follow_symlinks: true,
        }
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Restrict scanning to the given extensions.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    /// Set the maximum file size in bytes.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Set the maximum depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Get default exclude patterns.
    fn default_excludes() -> Vec<String> {
        vec![
            // Version control
            "**/.git/**".to_string(),
            "**/.svn/**".to_string(),
            "**/.hg/**".to_string(),
            // Dependencies
            "**/node_modules/**".to_string(),
            "**/target/**".to_string(),
            "**/vendor/**".to_string(),
            "**/.venv/**".to_string(),
            "**/venv/**".to_string(),
            // Build artifacts
            "**/build/**".to_string(),
            "**/dist/**".to_string(),
            "**/__pycache__/**".to_string(),
            "**/*.pyc".to_string(),
            // IDE/Editor
            "**/.idea/**".to_string(),
            "**/.vscode/**".to_string(),
            "**/*.swp".to_string(),
            "**/*~".to_string(),
            // System files
            "**/.DS_Store".to_string(),
            "**/Thumbs.db".to_string(),
            // Lock files carry no meaning worth embedding
            "**/*.lock".to_string(),
            "**/package-lock.json".to_string(),
        ]
    }

    /// Compile the exclude patterns, rejecting invalid ones.
    pub fn compile_excludes(&self) -> Result<Vec<glob::Pattern>> {
        self.exclude_patterns
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern)
                    .map_err(|e| ScanError::InvalidPattern(format!("{pattern}: {e}")))
            })
            .collect()
    }

    /// Check if a path should be excluded.
    pub fn should_exclude(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy().replace('\\', "/");

        self.exclude_patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern).is_ok_and(|glob| glob.matches(&path_str))
        })
    }

    /// Check whether a file extension passes the extension filter.
    pub fn accepts_extension(&self, path: &Path) -> bool {
        let Some(allowed) = &self.extensions else {
            return true;
        };
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::new()
    }
}
