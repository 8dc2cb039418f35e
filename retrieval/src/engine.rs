//! The engine handle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use compass_change_detector::{
    ChangeDetector, FileRecord, FsScanner, Language, Scanner, Snapshot, canonical_root, path_key,
};
use compass_chunker::{Chunk, ChunkError, Chunker, Symbol};
use compass_embeddings::{EmbeddingPool, EmbeddingProvider, EmbeddingRequest};
use compass_index::{CompactStats, IndexEntry, IndexManager, path_has_prefix};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, RetrievalError};
use crate::quick_index::{LookupOptions, QuickIndex, QuickMatch};
use crate::search::{SearchOptions, SearchResult, query_terms, rank};

/// Incremental semantic index over a set of directories.
///
/// One build runs at a time; searches and lookups run concurrently with it
/// and see the last applied per-file batch.
pub struct CompassEngine {
    /// Configuration.
    config: EngineConfig,

    /// Canonical roots a path filter may point into.
    roots: StdMutex<Vec<PathBuf>>,

    /// Produces scan records.
    scanner: Arc<dyn Scanner>,

    chunker: Arc<Chunker>,

    /// Embedding worker pool.
    pool: EmbeddingPool,

    /// Vector and metadata stores.
    index: RwLock<IndexManager>,

    /// Committed snapshot.
    detector: ChangeDetector,

    /// Filename and symbol lookup, swapped after every diff.
    quick: StdRwLock<Arc<QuickIndex>>,

    /// Held for the whole of a build or compaction.
    build_guard: Mutex<()>,

    /// Token of the current build.
    cancel: StdMutex<CancellationToken>,
}

/// Counts reported by a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub files_scanned: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_removed: usize,
    /// Files left out by the scanner or rejected while indexing.
    pub files_skipped: usize,
    /// New entries written.
    pub chunks_indexed: usize,
    /// Chunks already live with the same id.
    pub chunks_unchanged: usize,
    /// Chunks whose embedding failed after retries.
    pub chunks_failed: usize,
    /// Entries tombstoned by updates and removals.
    pub chunks_tombstoned: usize,
    pub duration_ms: u64,
    /// The build stopped early; unprocessed files are picked up next time.
    pub cancelled: bool,
    /// Compaction ran at the end of the build.
    pub compacted: bool,
}

/// Snapshot of engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Files in the committed snapshot.
    pub file_count: usize,
    /// Live index entries.
    pub chunk_count: usize,
    pub tombstoned_chunks: usize,
    pub stored_vectors: usize,
    pub last_build_time: Option<DateTime<Utc>>,
    pub build_in_progress: bool,
    pub quick_index_files: usize,
    /// Symbols available to quick lookups.
    pub symbol_count: usize,
    /// Committed files per language.
    pub files_by_language: BTreeMap<Language, usize>,
    /// Bytes used by the persisted index.
    pub index_size_bytes: u64,
    pub dimension: usize,
}

/// Result of indexing one file.
#[derive(Debug, Default)]
struct FileOutcome {
    inserted: usize,
    unchanged: usize,
    failed: usize,
    tombstoned: usize,
    unsupported: bool,
}

impl CompassEngine {
    /// Open the engine with the provider named in the configuration.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let provider = config.embedding.build_provider();
        Self::with_provider(config, provider).await
    }

    /// Open the engine with an explicit embedding provider.
    ///
    /// Persisted state is loaded from the data directory. Corrupt or
    /// incompatible state is discarded, and entries the stores disagree on
    /// are re-indexed by the next build.
    pub async fn with_provider(
        config: EngineConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        info!("Opening index in {}", config.data_dir.display());
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let pool = config.embedding.build_pool(provider);
        let dimension = pool.dimension();
        let db_path = config.db_path();
        let vectors_path = config.vectors_path();
        let index_config = config.index.clone();
        let (index, report) = tokio::task::spawn_blocking(move || {
            IndexManager::open(&db_path, &vectors_path, dimension, index_config)
        })
        .await??;

        if report.reset {
            warn!("Persisted index was unusable and has been reset");
        }
        if !report.touched_paths.is_empty() {
            warn!(
                "Reconciled {} stale entries and {} orphan vectors across {} files",
                report.stale_entries,
                report.orphan_vectors,
                report.touched_paths.len()
            );
        }

        let snapshot = index.load_snapshot()?;
        let snapshot = if report.touched_paths.is_empty() {
            snapshot
        } else {
            snapshot.without(&report.touched_paths)
        };
        let roots: Vec<PathBuf> = config
            .roots
            .iter()
            .map(|root| canonical_root(root).unwrap_or_else(|_| root.clone()))
            .collect();
        let root_keys: Vec<String> = roots.iter().map(|root| path_key(root)).collect();

        let symbols = index.load_symbols()?;
        let quick = build_quick_index(snapshot.records().values(), &symbols, &root_keys);

        let engine = Self {
            scanner: Arc::new(FsScanner::new(config.scan.clone())),
            chunker: Arc::new(Chunker::with_config(config.chunker.clone())),
            config,
            roots: StdMutex::new(roots),
            pool,
            index: RwLock::new(index),
            detector: ChangeDetector::with_snapshot(snapshot),
            quick: StdRwLock::new(Arc::new(quick)),
            build_guard: Mutex::new(()),
            cancel: StdMutex::new(CancellationToken::new()),
        };

        info!(
            "Index ready: {} files, {} quick-index symbols",
            engine.detector.current().len(),
            engine.quick_index().symbol_count()
        );
        Ok(engine)
    }

    /// Replace the file-system scanner.
    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Roots a path filter may point into.
    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Scan `dirs` (or the configured roots when empty) and bring the index
    /// up to date, waiting for a running build to finish first.
    pub async fn build_or_update_index(&self, dirs: &[PathBuf]) -> Result<BuildStats> {
        let _guard = self.build_guard.lock().await;
        self.run_build(dirs, false).await
    }

    /// Like [`CompassEngine::build_or_update_index`], but fails with
    /// [`RetrievalError::BuildInProgress`] instead of waiting.
    pub async fn try_build_or_update_index(&self, dirs: &[PathBuf]) -> Result<BuildStats> {
        let Ok(_guard) = self.build_guard.try_lock() else {
            return Err(RetrievalError::BuildInProgress);
        };
        self.run_build(dirs, false).await
    }

    /// Re-chunk every scanned file regardless of the snapshot.
    ///
    /// Chunks whose ids are already live are still not re-embedded.
    pub async fn rebuild(&self, dirs: &[PathBuf]) -> Result<BuildStats> {
        let _guard = self.build_guard.lock().await;
        self.run_build(dirs, true).await
    }

    /// Ask the running build to stop after the current file.
    pub fn cancel_build(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Rebuild the vector store from live entries only.
    pub async fn compact(&self) -> Result<CompactStats> {
        let _guard = self.build_guard.lock().await;
        let stats = self.index.write().await.compact()?;
        Ok(stats)
    }

    /// Ranked, explained chunks for a natural-language query.
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::Input("query is empty".to_string()));
        }

        let mut filters = options.filters;
        if let Some(prefix) = filters.path_prefix.take() {
            filters.path_prefix = Some(self.check_access(&prefix)?);
        }

        let search = &self.config.search;
        let k = options
            .k
            .unwrap_or(search.default_results)
            .clamp(1, search.max_results.max(1));
        let min_relevance = options.min_relevance.unwrap_or(search.min_relevance);

        let vector = self.pool.embed_one(EmbeddingRequest::new(query)).await?;
        let candidates = self.index.read().await.query(
            &vector,
            k * search.candidate_multiplier.max(1),
            &filters,
        )?;
        debug!("Query returned {} candidates for k={k}", candidates.len());

        let terms = query_terms(query);
        Ok(rank(
            &terms,
            candidates,
            &self.root_keys(),
            search,
            k,
            min_relevance,
        ))
    }

    /// Filename and symbol matches for `term`.
    pub fn quick_lookup(&self, term: &str) -> Vec<QuickMatch> {
        self.quick_index().lookup(term)
    }

    /// Filename and symbol matches with filters.
    pub fn quick_lookup_with(&self, term: &str, options: &LookupOptions) -> Vec<QuickMatch> {
        self.quick_index().lookup_with(term, options, Utc::now())
    }

    /// Live entries of one file in sequence order.
    pub async fn entries_for_path(&self, path: &str) -> Result<Vec<IndexEntry>> {
        Ok(self.index.read().await.entries_for_path(path)?)
    }

    /// Current counts.
    pub async fn status(&self) -> Result<EngineStatus> {
        let index = self.index.read().await.status()?;
        let quick = self.quick_index();
        Ok(EngineStatus {
            file_count: self.detector.current().len(),
            chunk_count: index.live_entries,
            tombstoned_chunks: index.tombstoned_entries,
            stored_vectors: index.stored_vectors,
            last_build_time: index.last_build_time,
            build_in_progress: self.build_guard.try_lock().is_err(),
            quick_index_files: quick.file_count(),
            symbol_count: quick.symbol_count(),
            files_by_language: index.files_by_language,
            index_size_bytes: index.size_bytes,
            dimension: index.dimension,
        })
    }

    fn root_keys(&self) -> Vec<String> {
        self.roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|root| path_key(root))
            .collect()
    }

    fn quick_index(&self) -> Arc<QuickIndex> {
        Arc::clone(&self.quick.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// Canonicalize the build roots and remember them as searchable.
    fn resolve_roots(&self, dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let requested = if dirs.is_empty() {
            self.config.roots.as_slice()
        } else {
            dirs
        };
        let mut resolved = Vec::with_capacity(requested.len());
        for dir in requested {
            resolved.push(canonical_root(dir)?);
        }

        let mut roots = self.roots.lock().unwrap_or_else(PoisonError::into_inner);
        for root in &resolved {
            if !roots.contains(root) {
                roots.push(root.clone());
            }
        }
        Ok(resolved)
    }

    /// Normalize a path filter, rejecting anything outside the roots.
    fn check_access(&self, prefix: &str) -> Result<String> {
        let path = Path::new(prefix);
        if !path.is_absolute() {
            return Err(RetrievalError::AccessDenied);
        }
        let resolved = match path.canonicalize() {
            Ok(resolved) => resolved,
            Err(_) if path.components().any(|c| matches!(c, Component::ParentDir)) => {
                return Err(RetrievalError::AccessDenied);
            }
            Err(_) => path.to_path_buf(),
        };
        let key = path_key(&resolved);
        let allowed = self
            .roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|root| path_has_prefix(&key, &path_key(root)));
        if allowed {
            Ok(key)
        } else {
            warn!("Rejected path filter outside the index roots");
            Err(RetrievalError::AccessDenied)
        }
    }

    async fn run_build(&self, dirs: &[PathBuf], force: bool) -> Result<BuildStats> {
        let started = Instant::now();
        let token = self.fresh_token();
        let roots = self.resolve_roots(dirs)?;

        let scanner = Arc::clone(&self.scanner);
        let scan_roots = roots.clone();
        let report = tokio::task::spawn_blocking(move || scanner.scan(&scan_roots)).await??;

        let scanned: Vec<String> = report.records.iter().map(|r| r.path.clone()).collect();
        let root_keys: Vec<String> = roots.iter().map(|root| path_key(root)).collect();
        let base = self.detector.current();
        let mut current = report.records;
        current.extend(
            base.records()
                .values()
                .filter(|r| !root_keys.iter().any(|root| path_has_prefix(&r.path, root)))
                .cloned(),
        );
        let pending = self.detector.diff(&current);
        let changes = &pending.changes;

        let mut stats = BuildStats {
            files_scanned: scanned.len(),
            files_added: changes.added.len(),
            files_modified: changes.modified.len(),
            files_removed: changes.removed.len(),
            files_skipped: report.skipped.len(),
            ..BuildStats::default()
        };

        let to_process: Vec<String> = if force {
            scanned
        } else {
            changes
                .added
                .iter()
                .chain(&changes.modified)
                .cloned()
                .collect()
        };

        if force || !changes.is_empty() {
            self.refresh_quick_index(&pending.snapshot, &to_process, &changes.removed)
                .await?;
        }

        let mut processed: Vec<String> = Vec::with_capacity(to_process.len());
        for path in &to_process {
            if token.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let Some(record) = pending.record(path) else {
                continue;
            };
            let outcome = match self.index_file(record).await {
                Ok(outcome) => outcome,
                Err(RetrievalError::Input(reason)) => {
                    warn!("Skipping {path}: {reason}");
                    stats.files_skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            stats.chunks_indexed += outcome.inserted;
            stats.chunks_unchanged += outcome.unchanged;
            stats.chunks_failed += outcome.failed;
            stats.chunks_tombstoned += outcome.tombstoned;
            if outcome.unsupported {
                stats.files_skipped += 1;
            }
            if outcome.failed == 0 {
                processed.push(path.clone());
            }
        }

        if token.is_cancelled() {
            stats.cancelled = true;
        } else {
            for path in &changes.removed {
                stats.chunks_tombstoned += self.index.write().await.remove(path)?;
                processed.push(path.clone());
            }
        }

        let now = Utc::now();
        let snapshot = pending
            .partial(processed.iter().map(String::as_str))
            .with_committed_at(now);
        {
            let index = self.index.read().await;
            index.flush()?;
            index.save_snapshot(&snapshot)?;
            index.set_last_build_time(now)?;
        }
        self.detector.commit(snapshot);

        {
            let mut index = self.index.write().await;
            if index.needs_compaction() {
                let compacted = index.compact()?;
                debug!(
                    "Compacted vector store from {} to {} slots",
                    compacted.stored_before, compacted.stored_after
                );
                stats.compacted = true;
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Build finished in {}ms: {} scanned, {} added, {} modified, {} removed, \
             {} chunks indexed, {} failed, {} files skipped{}",
            stats.duration_ms,
            stats.files_scanned,
            stats.files_added,
            stats.files_modified,
            stats.files_removed,
            stats.chunks_indexed,
            stats.chunks_failed,
            stats.files_skipped,
            if stats.cancelled { " (cancelled)" } else { "" }
        );
        Ok(stats)
    }

    /// Recompute symbols for `changed` files and swap in a new quick index.
    async fn refresh_quick_index(
        &self,
        scan: &Snapshot,
        changed: &[String],
        removed: &[String],
    ) -> Result<()> {
        let targets: Vec<FileRecord> = changed
            .iter()
            .filter_map(|path| scan.get(path).cloned())
            .collect();
        let chunker = Arc::clone(&self.chunker);
        let updated = tokio::task::spawn_blocking(move || {
            targets
                .into_iter()
                .map(|record| {
                    let symbols = std::fs::read_to_string(&record.path)
                        .map(|content| chunker.symbols(&content, record.language))
                        .unwrap_or_default();
                    (record.path, symbols)
                })
                .collect::<Vec<_>>()
        })
        .await?;

        let symbols = {
            let index = self.index.read().await;
            index.replace_symbols(&updated, removed)?;
            index.load_symbols()?
        };
        let quick = build_quick_index(scan.records().values(), &symbols, &self.root_keys());
        debug!(
            "Quick index rebuilt: {} files, {} symbols",
            quick.file_count(),
            quick.symbol_count()
        );
        *self.quick.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(quick);
        Ok(())
    }

    /// Chunk, embed and apply one file.
    async fn index_file(&self, record: &FileRecord) -> Result<FileOutcome> {
        let content = tokio::fs::read(&record.path)
            .await
            .map_err(|e| RetrievalError::Input(format!("cannot read file: {e}")))?;

        let chunker = Arc::clone(&self.chunker);
        let path = record.path.clone();
        let language = record.language;
        let chunked =
            tokio::task::spawn_blocking(move || chunker.chunk(&path, &content, language)).await?;

        let mut outcome = FileOutcome::default();
        let chunks = match chunked {
            Ok(chunks) => chunks,
            Err(ChunkError::Unsupported(reason)) => {
                debug!("Not indexing {}: {reason}", record.path);
                outcome.unsupported = true;
                Vec::new()
            }
            Err(e) => return Err(RetrievalError::Input(e.to_string())),
        };

        let expected: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let live = self.index.read().await.live_chunk_ids(&record.path)?;
        let fresh: Vec<&Chunk> = chunks.iter().filter(|c| !live.contains(&c.id)).collect();
        outcome.unchanged = chunks.len() - fresh.len();

        let requests = fresh
            .iter()
            .map(|c| EmbeddingRequest::new(c.embedding_text()).with_language(c.language.as_str()))
            .collect();
        let results = self.pool.embed_all(requests).await;

        let mut entries = Vec::with_capacity(fresh.len());
        let mut vectors = Vec::with_capacity(fresh.len());
        for (chunk, result) in fresh.iter().zip(results) {
            match result {
                Ok(vector) => {
                    entries.push(IndexEntry::from_chunk(chunk, record.git_tracked));
                    vectors.push(vector);
                }
                Err(e) => {
                    warn!(
                        "Chunk {} of {} not indexed: {e}",
                        chunk.sequence, record.path
                    );
                    outcome.failed += 1;
                }
            }
        }

        let applied = self
            .index
            .write()
            .await
            .sync_file(&record.path, &expected, &entries, &vectors)?;
        outcome.inserted = applied.inserted;
        outcome.tombstoned = applied.tombstoned;
        Ok(outcome)
    }
}

fn build_quick_index<'a>(
    records: impl IntoIterator<Item = &'a FileRecord>,
    symbols: &HashMap<String, Vec<Symbol>>,
    roots: &[String],
) -> QuickIndex {
    let files = records.into_iter().map(|record| {
        let file_symbols = symbols.get(&record.path).cloned().unwrap_or_default();
        (record.clone(), file_symbols)
    });
    QuickIndex::build_from_files(files, roots)
}
