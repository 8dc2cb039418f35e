//! Bounded in-memory cache for query embeddings.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::Embedding;

#[derive(Debug, Clone)]
struct CacheEntry {
    embedding: Embedding,
    /// Clock value of the last insert or hit.
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
    hits: u64,
    misses: u64,
}

/// Cache keyed by `(model, text)` that evicts the least recently used entry.
#[derive(Debug)]
pub struct EmbeddingCache {
    state: RwLock<CacheState>,
    max_entries: usize,
}

impl EmbeddingCache {
    /// Create a cache holding at most `max_entries` vectors.
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            max_entries,
        }
    }

    fn hash_key(text: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Look up an embedding, marking it as recently used.
    pub async fn get(&self, text: &str, model: &str) -> Option<Embedding> {
        let key = Self::hash_key(text, model);
        let mut state = self.state.write().await;
        state.clock += 1;
        let clock = state.clock;
        let found = state.entries.get_mut(&key).map(|e| {
            e.last_used = clock;
            e.embedding.clone()
        });
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        found
    }

    /// Store an embedding, evicting the least recently used entry when full.
    pub async fn put(&self, text: &str, model: &str, embedding: Embedding) {
        if self.max_entries == 0 {
            return;
        }
        let key = Self::hash_key(text, model);
        let mut state = self.state.write().await;

        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
            let stalest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(stalest) = stalest {
                state.entries.remove(&stalest);
            }
        }

        state.clock += 1;
        let last_used = state.clock;
        state.entries.insert(
            key,
            CacheEntry {
                embedding,
                last_used,
            },
        );
        debug!("Cached embedding (model: {model})");
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        info!("Cleared embedding cache");
    }

    /// Current statistics.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            entries: state.entries.len(),
            max_entries: self.max_entries,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached embeddings.
    pub entries: usize,

    /// Capacity.
    pub max_entries: usize,

    /// Lookups that found an entry.
    pub hits: u64,

    /// Lookups that did not.
    pub misses: u64,
}
