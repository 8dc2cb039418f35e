//! Default file-system scanner producing [`FileRecord`]s.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::language::Language;
use crate::record::{FileRecord, content_hash, path_key};

/// Number of leading bytes inspected for NUL bytes.
const BINARY_PROBE_BYTES: usize = 8 * 1024;

/// Enumerates candidate files under a set of roots.
///
/// The change detector only ever sees the records a scanner returns.
pub trait Scanner: Send + Sync {
    /// Scan every root and return one record per indexable file.
    fn scan(&self, roots: &[PathBuf]) -> Result<ScanReport>;
}

/// Why a file was left out of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Larger than the configured maximum.
    TooLarge,
    /// Contains NUL bytes.
    Binary,
    /// Could not be read.
    Unreadable,
    /// The path is not valid UTF-8 and has no stable key.
    NonUtf8Path,
}

/// A file the scanner saw but did not record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: SkipReason,
}

/// Result of one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    /// Records sorted by path.
    pub records: Vec<FileRecord>,

    /// Files seen but skipped.
    pub skipped: Vec<SkippedFile>,

    /// Time taken in milliseconds.
    pub duration_ms: u64,
}

/// `walkdir` based scanner.
#[derive(Debug, Clone, Default)]
pub struct FsScanner {
    config: ScanConfig,
}

impl FsScanner {
    /// Create a scanner with the given configuration.
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// The scanner's configuration.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    fn scan_root(
        &self,
        root: &Path,
        excludes: &[glob::Pattern],
        records: &mut BTreeMap<String, FileRecord>,
        skipped: &mut Vec<SkippedFile>,
        git_dirs: &mut HashMap<PathBuf, bool>,
    ) {
        let is_excluded = |rel: &Path| {
            let rel = rel.to_string_lossy().replace('\\', "/");
            excludes.iter().any(|p| p.matches(&rel))
        };

        let walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .max_depth(self.config.max_depth.unwrap_or(usize::MAX))
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let Ok(rel) = entry.path().strip_prefix(root) else {
                    return true;
                };
                if entry.file_type().is_dir() {
                    // Probe a child path so `dir/**` patterns prune the whole directory.
                    !is_excluded(rel) && !is_excluded(&rel.join("_"))
                } else {
                    !is_excluded(rel)
                }
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry under {}: {e}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if !self.config.accepts_extension(path) {
                continue;
            }
            let key = path_key(path);
            if path.to_str().is_none() {
                warn!("Skipping {key}: path is not valid UTF-8");
                skipped.push(SkippedFile {
                    path: key,
                    reason: SkipReason::NonUtf8Path,
                });
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Cannot stat {key}: {e}");
                    skipped.push(SkippedFile {
                        path: key,
                        reason: SkipReason::Unreadable,
                    });
                    continue;
                }
            };
            if metadata.len() > self.config.max_file_size {
                skipped.push(SkippedFile {
                    path: key,
                    reason: SkipReason::TooLarge,
                });
                continue;
            }

            let content = match fs::read(path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Cannot read {key}: {e}");
                    skipped.push(SkippedFile {
                        path: key,
                        reason: SkipReason::Unreadable,
                    });
                    continue;
                }
            };
            if is_binary(&content) {
                skipped.push(SkippedFile {
                    path: key,
                    reason: SkipReason::Binary,
                });
                continue;
            }

            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH));
            let git_tracked = path
                .parent()
                .is_some_and(|dir| in_git_tree(dir, git_dirs));

            records.insert(
                key.clone(),
                FileRecord {
                    path: key,
                    content_hash: content_hash(&content),
                    size: content.len() as u64,
                    modified,
                    language: Language::from_path(path),
                    git_tracked,
                },
            );
        }
    }
}

impl Scanner for FsScanner {
    fn scan(&self, roots: &[PathBuf]) -> Result<ScanReport> {
        let start = Instant::now();
        let excludes = self.config.compile_excludes()?;

        let mut records = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut git_dirs = HashMap::new();

        for root in roots {
            let root = canonical_root(root)?;
            self.scan_root(&root, &excludes, &mut records, &mut skipped, &mut git_dirs);
        }

        let duration = start.elapsed();
        info!(
            "Scanned {} files in {:?} ({} skipped)",
            records.len(),
            duration,
            skipped.len()
        );

        Ok(ScanReport {
            records: records.into_values().collect(),
            skipped,
            duration_ms: duration.as_millis() as u64,
        })
    }
}

/// Resolve an index root, rejecting missing paths and plain files.
pub fn canonical_root(root: &Path) -> Result<PathBuf> {
    let resolved = root
        .canonicalize()
        .map_err(|_| ScanError::RootNotFound(root.display().to_string()))?;
    if !resolved.is_dir() {
        return Err(ScanError::NotADirectory(root.display().to_string()));
    }
    Ok(resolved)
}

/// True when the leading bytes contain a NUL byte.
pub fn is_binary(content: &[u8]) -> bool {
    content.iter().take(BINARY_PROBE_BYTES).any(|&b| b == 0)
}

/// Whether `dir` or one of its ancestors holds a `.git` entry.
fn in_git_tree(dir: &Path, cache: &mut HashMap<PathBuf, bool>) -> bool {
    let mut visited = Vec::new();
    let mut current = Some(dir);
    let mut found = false;

    while let Some(candidate) = current {
        if let Some(&known) = cache.get(candidate) {
            found = known;
            break;
        }
        visited.push(candidate.to_path_buf());
        if candidate.join(".git").exists() {
            found = true;
            break;
        }
        current = candidate.parent();
    }

    for path in visited {
        cache.insert(path, found);
    }
    found
}
