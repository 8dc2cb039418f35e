//! Query parsing and re-ranking.

use std::collections::HashSet;

use compass_index::{IndexEntry, QueryFilters, SearchHit, relative_path};
use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::explain::{Explanation, explain};

/// Number of characters shown by [`SearchResult::preview`].
pub const PREVIEW_CHARS: usize = 200;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "can", "need", "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into",
    "through", "during", "before", "after", "above", "below", "between", "under", "again",
    "then", "once", "here", "there", "when", "where", "why", "how", "all", "each", "few", "more",
    "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than",
    "too", "very", "just", "and", "but", "if", "or", "because", "until", "while", "what",
    "which", "who", "whom", "this", "that", "these", "those", "am", "i", "my", "me", "we", "our",
    "you", "your", "it", "its", "they", "them", "their", "find", "show", "file", "files", "code",
];

/// Distinct lowercase terms of a query, in order of first appearance.
///
/// Words shorter than two characters and stop words are dropped.
pub fn query_terms(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut seen = HashSet::new();
    lower
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
        .filter(|word| word.chars().count() >= 2 && !STOP_WORDS.contains(word))
        .filter(|word| seen.insert(*word))
        .map(String::from)
        .collect()
}

/// Per-query search options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Number of results; clamped to `[1, max_results]`. `None` uses the
    /// configured default.
    pub k: Option<usize>,

    pub filters: QueryFilters,

    /// Overrides [`SearchConfig::min_relevance`].
    pub min_relevance: Option<f32>,
}

impl SearchOptions {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_filters(mut self, filters: QueryFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_min_relevance(mut self, min_relevance: f32) -> Self {
        self.min_relevance = Some(min_relevance);
        self
    }
}

/// A ranked, explained search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub entry: IndexEntry,

    /// Combined ranking score.
    pub score: f32,

    /// Cosine similarity between the query and the chunk.
    pub similarity: f32,

    /// Fraction of query terms found in the chunk.
    pub lexical_overlap: f32,

    pub explanation: Explanation,
}

impl SearchResult {
    /// First characters of the chunk text.
    pub fn preview(&self) -> String {
        let trimmed = self.entry.text.trim();
        let mut preview: String = trimmed.chars().take(PREVIEW_CHARS).collect();
        if trimmed.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }
        preview
    }
}

/// Re-rank nearest-neighbor candidates and keep the best `k`.
///
/// Paths are matched relative to the index `roots`. Ties on score go to the
/// shorter chunk, then to path and sequence order.
pub fn rank(
    terms: &[String],
    candidates: Vec<SearchHit>,
    roots: &[String],
    config: &SearchConfig,
    k: usize,
    min_relevance: f32,
) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .map(|hit| {
            let relative = relative_path(&hit.entry.path, roots);
            let explanation = explain(terms, &hit.entry, hit.similarity, relative);
            let lexical_overlap = explanation.overlap(terms.len());
            let score =
                config.semantic_weight * hit.similarity + config.lexical_weight * lexical_overlap;
            SearchResult {
                entry: hit.entry,
                score,
                similarity: hit.similarity,
                lexical_overlap,
                explanation,
            }
        })
        .filter(|result| result.score >= min_relevance)
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entry.text.len().cmp(&b.entry.text.len()))
            .then_with(|| a.entry.path.cmp(&b.entry.path))
            .then_with(|| a.entry.sequence.cmp(&b.entry.sequence))
    });
    results.truncate(k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use compass_change_detector::Language;
    use compass_chunker::ChunkKind;
    use pretty_assertions::assert_eq;

    fn hit(path: &str, sequence: u32, text: &str, similarity: f32) -> SearchHit {
        SearchHit {
            entry: IndexEntry {
                chunk_id: format!("{path}#{sequence}"),
                path: path.to_string(),
                sequence,
                kind: ChunkKind::Window,
                name: None,
                language: Language::Unknown,
                git_tracked: false,
                start_line: 1,
                end_line: 1,
                start_byte: 0,
                end_byte: text.len(),
                text: text.to_string(),
                context: None,
            },
            similarity,
        }
    }

    fn roots() -> Vec<String> {
        vec!["/r".to_string()]
    }

    fn ids(results: &[SearchResult]) -> Vec<String> {
        results.iter().map(|r| r.entry.chunk_id.clone()).collect()
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(
            query_terms("Where is the retry_policy for HTTP? http, backoff!"),
            vec!["retry_policy", "http", "backoff"]
        );
        assert!(query_terms("  ").is_empty());
        assert!(query_terms("a the of").is_empty());
    }

    #[test]
    fn test_lexical_overlap_breaks_semantic_ties() {
        let terms = query_terms("token bucket");
        let candidates = vec![
            hit("/r/a.txt", 0, "nothing relevant here", 0.6),
            hit("/r/b.txt", 0, "a token bucket limiter", 0.6),
        ];
        let results = rank(&terms, candidates, &roots(), &SearchConfig::default(), 10, 0.0);
        assert_eq!(ids(&results), vec!["/r/b.txt#0", "/r/a.txt#0"]);
        assert_eq!(results[0].lexical_overlap, 1.0);
        assert!((results[0].score - (0.8 * 0.6 + 0.2)).abs() < 1e-6);
    }

    #[test]
    fn test_ties_prefer_shorter_then_path() {
        let candidates = vec![
            hit("/r/c.txt", 0, "longer text body", 0.5),
            hit("/r/b.txt", 1, "short", 0.5),
            hit("/r/a.txt", 0, "short", 0.5),
        ];
        let results = rank(&[], candidates, &roots(), &SearchConfig::default(), 10, 0.0);
        assert_eq!(ids(&results), vec!["/r/a.txt#0", "/r/b.txt#1", "/r/c.txt#0"]);
    }

    #[test]
    fn test_min_relevance_and_truncation() {
        let candidates = vec![
            hit("/r/a.txt", 0, "x", 0.9),
            hit("/r/b.txt", 0, "x", 0.5),
            hit("/r/c.txt", 0, "x", 0.1),
        ];
        let results = rank(&[], candidates.clone(), &roots(), &SearchConfig::default(), 10, 0.3);
        assert_eq!(ids(&results), vec!["/r/a.txt#0", "/r/b.txt#0"]);

        let results = rank(&[], candidates, &roots(), &SearchConfig::default(), 1, 0.0);
        assert_eq!(ids(&results), vec!["/r/a.txt#0"]);
    }

    #[test]
    fn test_root_directory_name_adds_no_overlap() {
        let terms = query_terms("widgets");
        let roots = vec!["/home/dev/widgets".to_string()];
        let candidates: Vec<SearchHit> = (0..30)
            .map(|i| hit(&format!("/home/dev/widgets/src/m{i}.rs"), 0, "fn gear() {}", 0.2))
            .collect();

        let kept = rank(&terms, candidates.clone(), &roots, &SearchConfig::default(), 50, 0.0);
        assert_eq!(kept.len(), 30);
        assert!(kept.iter().all(|r| r.lexical_overlap == 0.0));
        assert!(kept.iter().all(|r| r.explanation.matched_terms.is_empty()));

        let config = SearchConfig::default();
        assert_eq!(config.min_relevance, 0.3);
        let dropped = rank(&terms, candidates, &roots, &config, 50, config.min_relevance);
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(PREVIEW_CHARS + 5);
        let result = rank(
            &[],
            vec![hit("/r/a.txt", 0, &long, 0.5)],
            &roots(),
            &SearchConfig::default(),
            1,
            0.0,
        );
        assert_eq!(result[0].preview().chars().count(), PREVIEW_CHARS + 3);
    }
}
