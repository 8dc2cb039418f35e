//! The index manager keeps the vector store and the metadata store in step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use compass_change_detector::{Language, Snapshot};
use compass_chunker::Symbol;
use compass_embeddings::Embedding;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::entry::{IndexEntry, QueryFilters, SearchHit};
use crate::error::{IndexError, Result};
use crate::metadata::{META_DIMENSION, MetadataStore, WriteBatch};
use crate::vector::{Slot, VectorStore};

/// What [`IndexManager::open`] had to repair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    /// Persisted state was unusable and has been cleared.
    pub reset: bool,

    /// Metadata entries whose vector was missing; now tombstoned.
    pub stale_entries: usize,

    /// Live vectors without a metadata entry; now tombstoned.
    pub orphan_vectors: usize,

    /// Files whose entries were repaired. Their snapshot records are dropped
    /// so the next build re-indexes them.
    pub touched_paths: Vec<String>,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    /// New entries written.
    pub inserted: usize,

    /// Entries already live under the same id.
    pub unchanged: usize,

    /// Prior entries replaced or dropped.
    pub tombstoned: usize,
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactStats {
    pub stored_before: usize,
    pub stored_after: usize,
}

/// Counts reported by [`IndexManager::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStatus {
    pub live_entries: usize,
    pub tombstoned_entries: usize,
    pub stored_vectors: usize,
    pub indexed_files: usize,
    pub dimension: usize,
    pub tombstone_ratio: f64,
    pub last_build_time: Option<DateTime<Utc>>,
    /// Committed files per language.
    pub files_by_language: BTreeMap<Language, usize>,
    /// Bytes on disk across the database, its WAL and the vector blob.
    pub size_bytes: u64,
}

/// Owns the nearest-neighbor structure and the metadata store.
///
/// Every mutating call leaves both stores agreeing on the set of live chunk
/// ids. Vectors reach disk on [`flush`](Self::flush); anything written to
/// the metadata store but not flushed is repaired on the next open.
#[derive(Debug)]
pub struct IndexManager {
    config: IndexConfig,
    metadata: MetadataStore,
    vectors: VectorStore,
    db_path: Option<PathBuf>,
    vectors_path: Option<PathBuf>,
}

impl IndexManager {
    /// Open the index persisted at `db_path` and `vectors_path`.
    ///
    /// Unreadable or incompatible state is cleared rather than returned as an
    /// error, and the two stores are reconciled in favor of the metadata store.
    pub fn open(
        db_path: &Path,
        vectors_path: &Path,
        dimension: usize,
        config: IndexConfig,
    ) -> Result<(Self, OpenReport)> {
        let mut report = OpenReport::default();

        let metadata = match MetadataStore::open(db_path) {
            Ok(metadata) => metadata,
            Err(e) if e.is_corruption() => {
                warn!("Discarding metadata store: {e}");
                remove_database_files(db_path)?;
                report.reset = true;
                MetadataStore::open(db_path)?
            }
            Err(e) => return Err(e),
        };

        let stored_dimension = metadata.meta(META_DIMENSION)?;
        let vectors = if stored_dimension
            .as_deref()
            .is_some_and(|stored| stored != dimension.to_string())
        {
            warn!(
                "Index was built with dimension {}, now {dimension}; rebuilding",
                stored_dimension.as_deref().unwrap_or_default()
            );
            report.reset = true;
            VectorStore::new(dimension)
        } else {
            match VectorStore::load(vectors_path, dimension) {
                Ok(Some(vectors)) => vectors,
                Ok(None) => VectorStore::new(dimension),
                Err(e) if e.is_corruption() => {
                    warn!("Discarding vector store: {e}");
                    report.reset = true;
                    VectorStore::new(dimension)
                }
                Err(e) => return Err(e),
            }
        };

        let mut manager = Self {
            config,
            metadata,
            vectors,
            db_path: Some(db_path.to_path_buf()),
            vectors_path: Some(vectors_path.to_path_buf()),
        };

        if report.reset {
            manager.reset()?;
        } else {
            let repaired = manager.reconcile()?;
            report.stale_entries = repaired.stale_entries;
            report.orphan_vectors = repaired.orphan_vectors;
            report.touched_paths = repaired.touched_paths;
        }
        manager
            .metadata
            .set_meta(META_DIMENSION, &dimension.to_string())?;

        Ok((manager, report))
    }

    /// An index that lives only in memory.
    pub fn in_memory(dimension: usize, config: IndexConfig) -> Result<Self> {
        let metadata = MetadataStore::open_in_memory()?;
        metadata.set_meta(META_DIMENSION, &dimension.to_string())?;
        Ok(Self {
            config,
            metadata,
            vectors: VectorStore::new(dimension),
            db_path: None,
            vectors_path: None,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    /// Insert entries whose ids are not yet live.
    ///
    /// A live entry with the same id is left alone. A live entry at the same
    /// `(path, sequence)` with a different id is tombstoned.
    pub fn upsert(&mut self, entries: &[IndexEntry], vectors: &[Embedding]) -> Result<UpsertStats> {
        self.write(entries, vectors, None)
    }

    /// Bring one file's entries in line with its new chunk set.
    ///
    /// Upserts `entries` and tombstones every live entry of `path` whose id is
    /// not in `expected_ids`, in one metadata transaction.
    pub fn sync_file(
        &mut self,
        path: &str,
        expected_ids: &HashSet<String>,
        entries: &[IndexEntry],
        vectors: &[Embedding],
    ) -> Result<UpsertStats> {
        if let Some(stray) = entries.iter().find(|e| e.path != path) {
            return Err(IndexError::InvalidInput(format!(
                "entry {} does not belong to {path}",
                stray.chunk_id
            )));
        }
        self.write(entries, vectors, Some((path, expected_ids)))
    }

    fn write(
        &mut self,
        entries: &[IndexEntry],
        vectors: &[Embedding],
        retain: Option<(&str, &HashSet<String>)>,
    ) -> Result<UpsertStats> {
        if entries.len() != vectors.len() {
            return Err(IndexError::InvalidInput(format!(
                "{} entries but {} vectors",
                entries.len(),
                vectors.len()
            )));
        }
        let dimension = self.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        let mut live_by_path: HashMap<&str, HashSet<String>> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut pending: Vec<(&IndexEntry, &Embedding)> = Vec::new();
        let mut unchanged = 0;
        for (entry, vector) in entries.iter().zip(vectors) {
            if !live_by_path.contains_key(entry.path.as_str()) {
                let live = self.metadata.live_chunk_ids(&entry.path)?;
                live_by_path.insert(entry.path.as_str(), live);
            }
            let already_live = live_by_path
                .get(entry.path.as_str())
                .is_some_and(|live| live.contains(&entry.chunk_id));
            if already_live || !seen.insert(entry.chunk_id.as_str()) {
                unchanged += 1;
                continue;
            }
            pending.push((entry, vector));
        }

        let rollback_len = self.vectors.stored_count();
        let mut inserts = Vec::with_capacity(pending.len());
        for (entry, vector) in &pending {
            match self.vectors.push(&entry.chunk_id, vector) {
                Ok(slot) => inserts.push((*entry, slot)),
                Err(e) => {
                    self.vectors.truncate(rollback_len);
                    return Err(e);
                }
            }
        }

        let batch = WriteBatch { inserts, retain };
        let tombstoned = match self.metadata.apply_batch(&batch) {
            Ok(slots) => slots,
            Err(e) => {
                self.vectors.truncate(rollback_len);
                return Err(e);
            }
        };
        for slot in &tombstoned {
            self.vectors.tombstone(*slot);
        }

        let stats = UpsertStats {
            inserted: batch.inserts.len(),
            unchanged,
            tombstoned: tombstoned.len(),
        };
        debug!(
            "Upserted {} entries ({} unchanged, {} tombstoned)",
            stats.inserted, stats.unchanged, stats.tombstoned
        );
        Ok(stats)
    }

    /// Ids of the live entries of one file.
    pub fn live_chunk_ids(&self, path: &str) -> Result<HashSet<String>> {
        self.metadata.live_chunk_ids(path)
    }

    /// Live entries of one file in sequence order.
    pub fn entries_for_path(&self, path: &str) -> Result<Vec<IndexEntry>> {
        self.metadata.entries_for_path(path)
    }

    /// Tombstone every entry of `path`. Returns how many were live.
    pub fn remove(&mut self, path: &str) -> Result<usize> {
        let slots = self.metadata.tombstone_path(path)?;
        for slot in &slots {
            self.vectors.tombstone(*slot);
        }
        debug!("Removed {} entries for {path}", slots.len());
        Ok(slots.len())
    }

    /// The `k` live entries nearest to `vector` that pass `filters`.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let allowed = if filters.is_empty() {
            None
        } else {
            let slots = self.metadata.filtered_slots(filters)?;
            if slots.is_empty() {
                return Ok(Vec::new());
            }
            Some(slots)
        };

        let hits = self.vectors.search(vector, k, allowed.as_ref())?;
        let slots: Vec<Slot> = hits.iter().map(|(slot, _)| *slot).collect();
        let mut entries = self.metadata.entries_for_slots(&slots)?;

        let mut results = Vec::with_capacity(hits.len());
        for (slot, similarity) in hits {
            match entries.remove(&slot) {
                Some(entry) => results.push(SearchHit { entry, similarity }),
                None => warn!("Vector slot {slot} has no live metadata entry"),
            }
        }
        Ok(results)
    }

    /// Fraction of stored vectors that are tombstoned.
    pub fn tombstone_ratio(&self) -> f64 {
        self.vectors.tombstone_ratio()
    }

    /// Whether the tombstone ratio exceeds the configured threshold.
    pub fn needs_compaction(&self) -> bool {
        self.tombstone_ratio() > self.config.compaction_threshold
    }

    /// Rebuild the vector structure from live entries only.
    pub fn compact(&mut self) -> Result<CompactStats> {
        let stored_before = self.vectors.stored_count();
        let mut compacted = self.vectors.clone();
        let mapping = compacted.compact();
        self.metadata.apply_compaction(&mapping)?;
        self.vectors = compacted;
        self.flush()?;

        let stats = CompactStats {
            stored_before,
            stored_after: self.vectors.stored_count(),
        };
        info!(
            "Compacted index from {} to {} vectors",
            stats.stored_before, stats.stored_after
        );
        Ok(stats)
    }

    /// Entry and vector counts.
    pub fn status(&self) -> Result<IndexStatus> {
        let counts = self.metadata.counts()?;
        Ok(IndexStatus {
            live_entries: counts.live,
            tombstoned_entries: counts.tombstoned,
            stored_vectors: self.vectors.stored_count(),
            indexed_files: counts.files,
            dimension: self.dimension(),
            tombstone_ratio: self.tombstone_ratio(),
            last_build_time: self.metadata.last_build_time()?,
            files_by_language: self.metadata.files_by_language()?,
            size_bytes: self.size_on_disk(),
        })
    }

    fn size_on_disk(&self) -> u64 {
        let mut files: Vec<PathBuf> = self
            .db_path
            .as_deref()
            .map(database_files)
            .into_iter()
            .flatten()
            .collect();
        files.extend(self.vectors_path.clone());
        files
            .iter()
            .filter_map(|path| std::fs::metadata(path).ok())
            .map(|metadata| metadata.len())
            .sum()
    }

    /// Verify that live metadata entries and live vectors match exactly.
    pub fn check_consistency(&self) -> Result<()> {
        let metadata: HashSet<(Slot, String)> = self
            .metadata
            .live_entries()?
            .into_iter()
            .map(|e| (e.slot, e.chunk_id))
            .collect();
        let vectors: HashSet<(Slot, String)> = self
            .vectors
            .live_slots()
            .map(|(slot, id)| (slot, id.to_string()))
            .collect();

        if metadata == vectors {
            return Ok(());
        }
        Err(IndexError::Consistency(format!(
            "{} metadata entries without a vector, {} vectors without an entry",
            metadata.difference(&vectors).count(),
            vectors.difference(&metadata).count()
        )))
    }

    /// Persist the vector store.
    pub fn flush(&self) -> Result<()> {
        if let Some(path) = &self.vectors_path {
            self.vectors.save(path)?;
        }
        Ok(())
    }

    /// Drop every entry, symbol and the snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.metadata.reset()?;
        self.vectors = VectorStore::new(self.dimension());
        self.flush()?;
        info!("Index reset");
        Ok(())
    }

    /// The last committed snapshot.
    pub fn load_snapshot(&self) -> Result<Snapshot> {
        self.metadata.load_snapshot()
    }

    /// Persist `snapshot` as the committed one.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.metadata.save_snapshot(snapshot)
    }

    pub fn load_symbols(&self) -> Result<HashMap<String, Vec<Symbol>>> {
        self.metadata.load_symbols()
    }

    pub fn replace_symbols(
        &self,
        updated: &[(String, Vec<Symbol>)],
        removed: &[String],
    ) -> Result<()> {
        self.metadata.replace_symbols(updated, removed)
    }

    pub fn set_last_build_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.metadata.set_last_build_time(at)
    }

    fn reconcile(&mut self) -> Result<OpenReport> {
        let mut report = OpenReport::default();
        let mut touched: HashSet<String> = HashSet::new();
        let mut matched: HashSet<Slot> = HashSet::new();
        let mut stale: Vec<String> = Vec::new();

        for entry in self.metadata.live_entries()? {
            let agrees = self.vectors.is_live(entry.slot)
                && self.vectors.chunk_id(entry.slot) == Some(entry.chunk_id.as_str());
            if agrees {
                matched.insert(entry.slot);
            } else {
                touched.insert(entry.path);
                stale.push(entry.chunk_id);
            }
        }

        let orphans: Vec<(Slot, String)> = self
            .vectors
            .live_slots()
            .filter(|(slot, _)| !matched.contains(slot))
            .map(|(slot, id)| (slot, id.to_string()))
            .collect();
        for (slot, chunk_id) in &orphans {
            self.vectors.tombstone(*slot);
            if let Some(path) = self.metadata.chunk_path(chunk_id)? {
                touched.insert(path);
            }
        }

        if stale.is_empty() && orphans.is_empty() {
            return Ok(report);
        }

        self.metadata.tombstone_chunks(&stale)?;
        let mut touched: Vec<String> = touched.into_iter().collect();
        touched.sort();

        let snapshot = self.metadata.load_snapshot()?;
        if !snapshot.is_empty() {
            let snapshot = snapshot.without(&touched);
            self.metadata.save_snapshot(&snapshot)?;
        }
        self.flush()?;

        warn!(
            "Reconciled index: {} stale entries, {} orphan vectors across {} files",
            stale.len(),
            orphans.len(),
            touched.len()
        );
        report.stale_entries = stale.len();
        report.orphan_vectors = orphans.len();
        report.touched_paths = touched;
        Ok(report)
    }
}

/// The SQLite database file and its WAL companions.
fn database_files(db_path: &Path) -> [PathBuf; 3] {
    ["", "-wal", "-shm"].map(|suffix| {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    })
}

fn remove_database_files(db_path: &Path) -> Result<()> {
    for path in database_files(db_path) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use compass_change_detector::Language;
    use compass_chunker::ChunkKind;
    use pretty_assertions::assert_eq;

    fn entry(path: &str, sequence: u32, id: &str) -> IndexEntry {
        IndexEntry {
            chunk_id: id.to_string(),
            path: path.to_string(),
            sequence,
            kind: ChunkKind::Function,
            name: None,
            language: Language::Python,
            git_tracked: false,
            start_line: 1,
            end_line: 1,
            start_byte: 0,
            end_byte: 10,
            text: format!("chunk {id}"),
            context: None,
        }
    }

    fn manager() -> IndexManager {
        IndexManager::in_memory(2, IndexConfig::default()).unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut index = manager();
        let entries = vec![entry("/r/a.py", 0, "a0"), entry("/r/a.py", 1, "a1")];
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];

        let first = index.upsert(&entries, &vectors).unwrap();
        assert_eq!(first.inserted, 2);

        let second = index.upsert(&entries, &vectors).unwrap();
        assert_eq!(
            second,
            UpsertStats {
                inserted: 0,
                unchanged: 2,
                tombstoned: 0
            }
        );
        assert_eq!(index.status().unwrap().stored_vectors, 2);
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_upsert_replaces_changed_sequence() {
        let mut index = manager();
        index
            .upsert(&[entry("/r/a.py", 0, "old")], &[vec![1.0, 0.0]])
            .unwrap();
        let stats = index
            .upsert(&[entry("/r/a.py", 0, "new")], &[vec![0.0, 1.0]])
            .unwrap();

        assert_eq!(stats.tombstoned, 1);
        let hits = index.query(&[1.0, 0.0], 5, &QueryFilters::default()).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.entry.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_sync_file_drops_missing_chunks() {
        let mut index = manager();
        index
            .upsert(
                &[entry("/r/a.py", 0, "a0"), entry("/r/a.py", 1, "a1")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .unwrap();

        let expected: HashSet<String> = ["a0".to_string()].into_iter().collect();
        let stats = index.sync_file("/r/a.py", &expected, &[], &[]).unwrap();

        assert_eq!(stats.tombstoned, 1);
        assert_eq!(index.live_chunk_ids("/r/a.py").unwrap(), expected);
        index.check_consistency().unwrap();
    }

    #[test]
    fn test_sync_file_rejects_foreign_entries() {
        let mut index = manager();
        let expected = HashSet::new();
        let result = index.sync_file("/r/a.py", &expected, &[entry("/r/b.py", 0, "b")], &[vec![1.0, 0.0]]);
        assert!(matches!(result, Err(IndexError::InvalidInput(_))));
    }

    #[test]
    fn test_dimension_mismatch_leaves_index_untouched() {
        let mut index = manager();
        let result = index.upsert(
            &[entry("/r/a.py", 0, "a"), entry("/r/a.py", 1, "b")],
            &[vec![1.0, 0.0], vec![1.0, 0.0, 0.0]],
        );
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
        assert_eq!(index.status().unwrap().stored_vectors, 0);
    }

    #[test]
    fn test_remove_and_compact() {
        let mut index = manager();
        index
            .upsert(
                &[entry("/r/a.py", 0, "a"), entry("/r/b.py", 0, "b")],
                &[vec![1.0, 0.0], vec![0.9, 0.1]],
            )
            .unwrap();

        assert_eq!(index.remove("/r/a.py").unwrap(), 1);
        let hits = index.query(&[1.0, 0.0], 5, &QueryFilters::default()).unwrap();
        assert!(hits.iter().all(|h| h.entry.path != "/r/a.py"));
        assert!(index.needs_compaction());

        let stats = index.compact().unwrap();
        assert_eq!(
            stats,
            CompactStats {
                stored_before: 2,
                stored_after: 1
            }
        );
        assert_eq!(index.tombstone_ratio(), 0.0);
        index.check_consistency().unwrap();

        let hits = index.query(&[1.0, 0.0], 5, &QueryFilters::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk_id, "b");
    }

    #[test]
    fn test_query_filters() {
        let mut index = manager();
        let mut rust = entry("/r/src/lib.rs", 0, "rs");
        rust.language = Language::Rust;
        index
            .upsert(
                &[entry("/r/a.py", 0, "py"), rust],
                &[vec![1.0, 0.0], vec![1.0, 0.0]],
            )
            .unwrap();

        let filters = QueryFilters::default().with_languages(vec![Language::Rust]);
        let hits = index.query(&[1.0, 0.0], 5, &filters).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.chunk_id, "rs");

        let filters = QueryFilters::default().with_git_only(true);
        assert!(index.query(&[1.0, 0.0], 5, &filters).unwrap().is_empty());
    }
}
