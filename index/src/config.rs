//! Index settings.

use serde::{Deserialize, Serialize};

/// Tombstone ratio above which a build triggers compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.2;

/// Settings for the [`IndexManager`](crate::IndexManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Compact once tombstones exceed this fraction of stored vectors.
    pub compaction_threshold: f64,
}

impl IndexConfig {
    pub fn with_compaction_threshold(mut self, threshold: f64) -> Self {
        self.compaction_threshold = threshold;
        self
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}
