//! Committed snapshots and the change detector.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::merkle::{ChangeSet, MerkleHash, MerkleTree};
use crate::record::FileRecord;

/// A Merkle root plus the file records it covers.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Arc<BTreeMap<String, FileRecord>>,
    tree: MerkleTree,
    committed_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// The snapshot of an index that was never built.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from scan records.
    pub fn from_records(records: impl IntoIterator<Item = FileRecord>) -> Self {
        let records: BTreeMap<String, FileRecord> =
            records.into_iter().map(|r| (r.path.clone(), r)).collect();
        let tree = MerkleTree::build(records.values());
        Self {
            records: Arc::new(records),
            tree,
            committed_at: None,
        }
    }

    /// Set the commit timestamp.
    pub fn with_committed_at(mut self, at: DateTime<Utc>) -> Self {
        self.committed_at = Some(at);
        self
    }

    /// Apply updated and removed records on top of this snapshot.
    pub fn with_updates(&self, updated: &[FileRecord], removed: &[String]) -> Self {
        if updated.is_empty() && removed.is_empty() {
            return self.clone();
        }
        let mut records = (*self.records).clone();
        for path in removed {
            records.remove(path);
        }
        for record in updated {
            records.insert(record.path.clone(), record.clone());
        }
        let tree = self
            .tree
            .apply(updated, removed.iter().map(String::as_str));
        Self {
            records: Arc::new(records),
            tree,
            committed_at: self.committed_at,
        }
    }

    /// Drop the given paths so the next diff reports them as added.
    pub fn without(&self, paths: &[String]) -> Self {
        self.with_updates(&[], paths)
    }

    /// Root hash of the tree.
    pub fn root_hash(&self) -> MerkleHash {
        self.tree.root_hash()
    }

    /// Root hash as lowercase hex.
    pub fn root_hex(&self) -> String {
        self.tree.root_hex()
    }

    /// The Merkle tree.
    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    /// Records by path.
    pub fn records(&self) -> &BTreeMap<String, FileRecord> {
        &self.records
    }

    /// Look up one record.
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    /// Number of files covered.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no files are covered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When this snapshot was committed.
    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        self.committed_at
    }
}

/// The result of [`ChangeDetector::diff`]; nothing is committed yet.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    /// The snapshot the diff was computed against.
    pub base: Arc<Snapshot>,
    /// Files that changed since `base`.
    pub changes: ChangeSet,
    /// Snapshot describing the full scan.
    pub snapshot: Snapshot,
}

impl PendingSnapshot {
    /// The scan record for a path, if it still exists.
    pub fn record(&self, path: &str) -> Option<&FileRecord> {
        self.snapshot.get(path)
    }

    /// The base snapshot with only `processed` paths brought up to date.
    ///
    /// Processed paths present in the scan are updated; the others are
    /// removed. Unprocessed changes stay as they were in `base`, so the next
    /// diff reports them again.
    pub fn partial<'a>(&self, processed: impl IntoIterator<Item = &'a str>) -> Snapshot {
        let mut updated = Vec::new();
        let mut removed = Vec::new();
        for path in processed {
            match self.snapshot.get(path) {
                Some(record) => updated.push(record.clone()),
                None => removed.push(path.to_string()),
            }
        }
        self.base.with_updates(&updated, &removed)
    }
}

/// Tracks the current snapshot and computes diffs against it.
///
/// Readers get an `Arc` to the committed snapshot; `commit` swaps it in one
/// step, so a reader never sees a half-applied update.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    current: RwLock<Arc<Snapshot>>,
}

impl ChangeDetector {
    /// Create a detector with an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detector starting from a previously committed snapshot.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The committed snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Compare scan records against the committed snapshot.
    ///
    /// Has no side effects; call [`ChangeDetector::commit`] to make the
    /// result current.
    pub fn diff(&self, current_files: &[FileRecord]) -> PendingSnapshot {
        let base = self.current();
        let records: BTreeMap<String, FileRecord> = current_files
            .iter()
            .map(|r| (r.path.clone(), r.clone()))
            .collect();
        let tree = base.tree().rebuild(records.values());
        let changes = base.tree().diff(&tree);

        debug!(
            "Diff: {} added, {} modified, {} removed",
            changes.added.len(),
            changes.modified.len(),
            changes.removed.len()
        );

        PendingSnapshot {
            base,
            changes,
            snapshot: Snapshot {
                records: Arc::new(records),
                tree,
                committed_at: None,
            },
        }
    }

    /// Atomically replace the committed snapshot.
    pub fn commit(&self, snapshot: Snapshot) {
        let snapshot = if snapshot.committed_at.is_some() {
            snapshot
        } else {
            snapshot.with_committed_at(Utc::now())
        };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Forget the committed snapshot.
    pub fn reset(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Snapshot::empty());
    }
}
