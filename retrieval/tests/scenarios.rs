//! End-to-end build and query scenarios.
//!
//! These tests run the whole engine against temporary directories with
//! deterministic in-process embedding providers:
//! - Empty and fresh builds, idempotent re-builds
//! - Single-file edits and deletions
//! - Provider failures, cancellation and reopening

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use compass_embeddings::{
    EmbeddingError, EmbeddingRequest, EmbeddingResponse, Result as EmbeddingResult,
};
use compass_retrieval::{
    CompassEngine, EmbeddingProvider, EngineConfig, IndexConfig, Language, LookupOptions,
    MatchKind, QueryFilters, RetrievalError, SearchOptions,
};
use pretty_assertions::assert_eq;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::Notify;

const DIMENSION: usize = 64;

const PYTHON: &str = "import os\nimport sys\n\n\ndef first(a):\n    return a + 1\n\n\ndef second(b):\n    return b * 2\n";

/// Bag-of-words embedding: each token hashes into one bucket.
fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMENSION];
    vector[0] = 0.1;
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = 1 + usize::from(digest[0]) % (DIMENSION - 1);
        vector[bucket] += 1.0;
    }
    vector
}

/// Deterministic provider; fails any text containing `fail_marker`.
struct HashingProvider {
    fail_marker: Option<&'static str>,
}

impl HashingProvider {
    fn new() -> Self {
        Self { fail_marker: None }
    }

    fn failing_on(marker: &'static str) -> Self {
        Self {
            fail_marker: Some(marker),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn default_model(&self) -> &str {
        "hashing-v1"
    }

    fn default_dimension(&self) -> usize {
        DIMENSION
    }

    async fn embed(&self, request: EmbeddingRequest) -> EmbeddingResult<EmbeddingResponse> {
        if let Some(marker) = self.fail_marker {
            if request.text.contains(marker) {
                return Err(EmbeddingError::MalformedResponse("refused".to_string()));
            }
        }
        EmbeddingResponse::validated(hash_embedding(&request.text), "hashing-v1")
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Blocks its first call until released.
struct GatedProvider {
    started: Arc<Notify>,
    release: Arc<Notify>,
    gated: AtomicBool,
}

#[async_trait]
impl EmbeddingProvider for GatedProvider {
    fn name(&self) -> &str {
        "gated"
    }

    fn default_model(&self) -> &str {
        "hashing-v1"
    }

    fn default_dimension(&self) -> usize {
        DIMENSION
    }

    async fn embed(&self, request: EmbeddingRequest) -> EmbeddingResult<EmbeddingResponse> {
        if !self.gated.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        EmbeddingResponse::validated(hash_embedding(&request.text), "hashing-v1")
    }

    fn is_available(&self) -> bool {
        true
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Workspace {
    data: TempDir,
    root: TempDir,
}

impl Workspace {
    fn new() -> Self {
        init_tracing();
        Self {
            data: TempDir::new().unwrap(),
            root: TempDir::new().unwrap(),
        }
    }

    fn root(&self) -> PathBuf {
        self.root.path().canonicalize().unwrap()
    }

    fn roots(&self) -> Vec<PathBuf> {
        vec![self.root()]
    }

    fn key(&self, relative: &str) -> String {
        format!("{}/{relative}", self.root().to_string_lossy().replace('\\', "/"))
    }

    fn write(&self, relative: &str, content: &str) {
        let path = self.root.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn delete(&self, relative: &str) {
        std::fs::remove_file(self.root.path().join(relative)).unwrap();
    }

    fn config(&self) -> EngineConfig {
        EngineConfig::new(self.data.path())
    }

    async fn engine(&self) -> CompassEngine {
        self.engine_with(self.config(), HashingProvider::new()).await
    }

    async fn engine_with(
        &self,
        config: EngineConfig,
        provider: impl EmbeddingProvider + 'static,
    ) -> CompassEngine {
        CompassEngine::with_provider(config, Arc::new(provider))
            .await
            .unwrap()
    }
}

fn chunk_ids(entries: &[compass_retrieval::IndexEntry]) -> Vec<String> {
    entries.iter().map(|e| e.chunk_id.clone()).collect()
}

fn paths(results: &[compass_retrieval::SearchResult]) -> Vec<&str> {
    results.iter().map(|r| r.entry.path.as_str()).collect()
}

#[tokio::test]
async fn test_empty_directory() {
    let ws = Workspace::new();
    let engine = ws.engine().await;

    let stats = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert_eq!(stats.files_scanned, 0);
    assert_eq!(stats.chunks_indexed, 0);

    let status = engine.status().await.unwrap();
    assert_eq!(status.file_count, 0);
    assert_eq!(status.chunk_count, 0);
    assert!(status.last_build_time.is_some());
}

#[tokio::test]
async fn test_python_file_and_idempotent_rebuild() {
    let ws = Workspace::new();
    ws.write("app/m.py", PYTHON);
    let engine = ws.engine().await;

    let stats = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert_eq!(stats.files_added, 1);
    assert_eq!(stats.chunks_indexed, 3);
    assert_eq!(stats.chunks_failed, 0);

    let entries = engine.entries_for_path(&ws.key("app/m.py")).await.unwrap();
    let names: Vec<Option<&str>> = entries.iter().map(|e| e.name.as_deref()).collect();
    assert_eq!(names, vec![None, Some("first"), Some("second")]);
    assert_eq!(entries[0].language, Language::Python);

    let again = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert_eq!(again.files_added + again.files_modified + again.files_removed, 0);
    assert_eq!(again.chunks_indexed, 0);

    let forced = engine.rebuild(&ws.roots()).await.unwrap();
    assert_eq!(forced.chunks_indexed, 0);
    assert_eq!(forced.chunks_unchanged, 3);

    let status = engine.status().await.unwrap();
    assert_eq!(status.file_count, 1);
    assert_eq!(status.chunk_count, 3);
    assert_eq!(status.tombstoned_chunks, 0);
}

#[tokio::test]
async fn test_one_line_edit_changes_only_that_chunk() {
    let ws = Workspace::new();
    ws.write("m.py", PYTHON);
    ws.write("other.py", "def other():\n    return 0\n");
    let engine = ws.engine().await;
    engine.build_or_update_index(&ws.roots()).await.unwrap();

    let before = engine.entries_for_path(&ws.key("m.py")).await.unwrap();
    let untouched = engine.entries_for_path(&ws.key("other.py")).await.unwrap();

    ws.write("m.py", &PYTHON.replace("b * 2", "b * 3"));
    let stats = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert_eq!(stats.files_modified, 1);
    assert_eq!(stats.files_added, 0);
    assert_eq!(stats.chunks_indexed, 1);
    assert_eq!(stats.chunks_unchanged, 2);
    assert_eq!(stats.chunks_tombstoned, 1);

    let after = engine.entries_for_path(&ws.key("m.py")).await.unwrap();
    assert_eq!(&chunk_ids(&before)[..2], &chunk_ids(&after)[..2]);
    assert_ne!(before[2].chunk_id, after[2].chunk_id);
    assert_eq!(
        chunk_ids(&engine.entries_for_path(&ws.key("other.py")).await.unwrap()),
        chunk_ids(&untouched)
    );
}

#[tokio::test]
async fn test_deleted_file_disappears_and_compacts() {
    let ws = Workspace::new();
    ws.write("keep.py", PYTHON);
    ws.write("gone.py", "def vanishing_helper():\n    return 'zebra'\n");
    let config = ws
        .config()
        .with_index(IndexConfig::default().with_compaction_threshold(1.0));
    let engine = ws.engine_with(config, HashingProvider::new()).await;
    engine.build_or_update_index(&ws.roots()).await.unwrap();

    ws.delete("gone.py");
    let stats = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert_eq!(stats.files_removed, 1);
    assert_eq!(stats.chunks_tombstoned, 1);
    assert!(!stats.compacted);

    let results = engine
        .search("vanishing_helper zebra", SearchOptions::default().with_k(50))
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.entry.path != ws.key("gone.py")));

    let status = engine.status().await.unwrap();
    assert_eq!(status.file_count, 1);
    assert_eq!(status.chunk_count, 3);
    assert_eq!(status.stored_vectors, 4);

    let compacted = engine.compact().await.unwrap();
    assert_eq!(compacted.stored_before, 4);
    assert_eq!(compacted.stored_after, 3);
    assert_eq!(engine.status().await.unwrap().stored_vectors, 3);
}

#[tokio::test]
async fn test_provider_failure_skips_file_and_retries_later() {
    let ws = Workspace::new();
    ws.write("good.py", PYTHON);
    ws.write("bad.txt", "EXPLODE this note cannot be embedded\n");
    let engine = ws
        .engine_with(ws.config(), HashingProvider::failing_on("EXPLODE"))
        .await;

    let stats = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert_eq!(stats.files_added, 2);
    assert_eq!(stats.chunks_failed, 1);
    assert_eq!(stats.chunks_indexed, 3);

    assert!(engine.entries_for_path(&ws.key("bad.txt")).await.unwrap().is_empty());
    let status = engine.status().await.unwrap();
    assert_eq!(status.chunk_count, 3);
    assert_eq!(status.file_count, 1);

    let retry = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert_eq!(retry.files_added, 1);
    assert_eq!(retry.chunks_failed, 1);
}

#[tokio::test]
async fn test_unique_token_round_trip() {
    let ws = Workspace::new();
    ws.write("notes/a.md", "# Plans\n\nNothing special here.\n");
    ws.write("notes/b.md", "# Travel\n\nBook the zanzibarquux ferry early.\n");
    ws.write("src/c.py", PYTHON);
    let engine = ws.engine().await;
    engine.build_or_update_index(&ws.roots()).await.unwrap();

    let results = engine
        .search("zanzibarquux", SearchOptions::default().with_k(3))
        .await
        .unwrap();
    assert_eq!(results[0].entry.path, ws.key("notes/b.md"));
    assert!(results[0].explanation.matched_terms.contains(&"zanzibarquux".to_string()));
    assert!(!results[0].explanation.summary.is_empty());
    assert!(results[0].preview().contains("zanzibarquux"));

    let filtered = engine
        .search(
            "zanzibarquux",
            SearchOptions::default()
                .with_filters(QueryFilters::default().with_path_prefix(ws.key("src")))
                .with_min_relevance(0.0),
        )
        .await
        .unwrap();
    assert_eq!(paths(&filtered), vec![ws.key("src/c.py"); filtered.len()]);
    assert!(!filtered.is_empty());

    let markdown = engine
        .search(
            "zanzibarquux",
            SearchOptions::default()
                .with_filters(QueryFilters::default().with_languages(vec![Language::Markdown])),
        )
        .await
        .unwrap();
    assert!(markdown.iter().all(|r| r.entry.language == Language::Markdown));
}

#[tokio::test]
async fn test_search_input_and_access_errors() {
    let ws = Workspace::new();
    ws.write("m.py", PYTHON);
    let engine = ws.engine().await;
    engine.build_or_update_index(&ws.roots()).await.unwrap();

    let err = engine.search(" \t ", SearchOptions::default()).await.unwrap_err();
    assert!(matches!(err, RetrievalError::Input(_)));

    let outside = SearchOptions::default()
        .with_filters(QueryFilters::default().with_path_prefix("/etc"));
    let err = engine.search("first", outside).await.unwrap_err();
    assert!(matches!(err, RetrievalError::AccessDenied));
    assert_eq!(err.to_string(), "Access denied");

    let clamped = engine
        .search("first", SearchOptions::default().with_k(0))
        .await
        .unwrap();
    assert_eq!(clamped.len(), 1);
}

#[tokio::test]
async fn test_root_directory_name_matches_nothing() {
    let ws = Workspace::new();
    ws.write("widgets/src/gear.py", PYTHON);
    ws.write("widgets/notes.txt", "plain notes\n");
    let engine = ws.engine().await;
    engine
        .build_or_update_index(&[ws.root().join("widgets")])
        .await
        .unwrap();

    assert!(engine.quick_lookup("widgets").is_empty());
    assert_eq!(engine.quick_lookup("src").len(), 1);

    let results = engine
        .search(
            "widgets",
            SearchOptions::default().with_k(50).with_min_relevance(0.0),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.explanation.matched_terms.is_empty()));
    assert!(results.iter().all(|r| r.lexical_overlap == 0.0));
}

#[tokio::test]
async fn test_status_reports_languages_symbols_and_size() {
    let ws = Workspace::new();
    ws.write("m.py", PYTHON);
    ws.write("notes.txt", "plain notes\n");
    let engine = ws.engine().await;
    engine.build_or_update_index(&ws.roots()).await.unwrap();

    let status = engine.status().await.unwrap();
    assert_eq!(
        status.files_by_language,
        BTreeMap::from([(Language::Python, 1), (Language::Text, 1)])
    );
    assert_eq!(status.symbol_count, 2);
    assert_eq!(status.quick_index_files, 2);
    assert!(status.index_size_bytes > 0);

    ws.delete("m.py");
    engine.build_or_update_index(&ws.roots()).await.unwrap();
    let status = engine.status().await.unwrap();
    assert_eq!(status.files_by_language, BTreeMap::from([(Language::Text, 1)]));
    assert_eq!(status.symbol_count, 0);
}

#[tokio::test]
async fn test_quick_lookup_follows_builds() {
    let ws = Workspace::new();
    ws.write("pkg/m.py", PYTHON);
    ws.write("pkg/readme.md", "# Second thoughts\n\nText.\n");
    let engine = ws.engine().await;
    assert!(engine.quick_lookup("second").is_empty());

    engine.build_or_update_index(&ws.roots()).await.unwrap();
    let matches = engine.quick_lookup("second");
    assert_eq!(matches[0].path, ws.key("pkg/m.py"));
    assert_eq!(matches[0].symbol.as_deref(), Some("second"));
    assert_eq!(matches[0].match_kind, MatchKind::Symbol);
    assert_eq!(matches[0].line, Some(9));

    let python_only = LookupOptions::default().with_languages(vec![Language::Python]);
    assert!(
        engine
            .quick_lookup_with("second", &python_only)
            .iter()
            .all(|m| m.language == Language::Python)
    );

    ws.delete("pkg/m.py");
    engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert!(
        engine
            .quick_lookup("second")
            .iter()
            .all(|m| m.path != ws.key("pkg/m.py"))
    );
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let ws = Workspace::new();
    ws.write("m.py", PYTHON);
    {
        let engine = ws.engine().await;
        engine.build_or_update_index(&ws.roots()).await.unwrap();
    }

    let engine = ws.engine().await;
    let status = engine.status().await.unwrap();
    assert_eq!(status.file_count, 1);
    assert_eq!(status.chunk_count, 3);
    assert_eq!(engine.quick_lookup("first")[0].path, ws.key("m.py"));

    let stats = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert_eq!(stats.files_added + stats.files_modified, 0);
    assert_eq!(stats.chunks_indexed, 0);
}

#[tokio::test]
async fn test_configured_roots_are_used_and_searchable() {
    let ws = Workspace::new();
    ws.write("lib/m.py", PYTHON);
    let config = ws.config().with_root(ws.root());
    let engine = ws.engine_with(config, HashingProvider::new()).await;

    let stats = engine.build_or_update_index(&[]).await.unwrap();
    assert_eq!(stats.files_added, 1);

    let results = engine
        .search(
            "first",
            SearchOptions::default()
                .with_filters(QueryFilters::default().with_path_prefix(ws.key("lib"))),
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn test_cancelled_build_keeps_progress() {
    let ws = Workspace::new();
    ws.write("a.txt", "alpha notes\n");
    ws.write("b.txt", "beta notes\n");
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let provider = GatedProvider {
        started: Arc::clone(&started),
        release: Arc::clone(&release),
        gated: AtomicBool::new(false),
    };
    let engine = Arc::new(ws.engine_with(ws.config(), provider).await);

    let build = tokio::spawn({
        let engine = Arc::clone(&engine);
        let roots = ws.roots();
        async move { engine.build_or_update_index(&roots).await }
    });

    started.notified().await;
    assert!(matches!(
        engine.try_build_or_update_index(&ws.roots()).await,
        Err(RetrievalError::BuildInProgress)
    ));
    engine.cancel_build();
    release.notify_one();

    let stats = build.await.unwrap().unwrap();
    assert!(stats.cancelled);
    assert_eq!(engine.status().await.unwrap().file_count, 1);
    assert_eq!(engine.entries_for_path(&ws.key("a.txt")).await.unwrap().len(), 1);

    let resumed = engine.build_or_update_index(&ws.roots()).await.unwrap();
    assert!(!resumed.cancelled);
    assert_eq!(resumed.files_added, 1);
    assert_eq!(engine.status().await.unwrap().file_count, 2);
}

#[test]
fn test_hash_embedding_is_deterministic() {
    assert_eq!(hash_embedding("alpha beta"), hash_embedding("Alpha  beta"));
}
