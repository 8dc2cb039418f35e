//! Lexical filename and symbol index.
//!
//! No embeddings are involved: a lookup is a case-insensitive exact, prefix
//! or substring match over file stems, top-level symbol names and paths
//! below the index roots. The index is immutable; the engine swaps in a new
//! one after every diff.

use chrono::{DateTime, Duration, Utc};
use compass_change_detector::{FileRecord, Language};
use compass_chunker::{ChunkKind, Symbol};
use compass_index::relative_path;
use serde::{Deserialize, Serialize};

/// Default number of matches returned by a lookup.
pub const DEFAULT_LOOKUP_LIMIT: usize = 20;

const STEM_EXACT: f32 = 1.0;
const SYMBOL_EXACT: f32 = 0.95;
const STEM_PREFIX: f32 = 0.9;
const SYMBOL_PREFIX: f32 = 0.85;
const STEM_SUBSTRING: f32 = 0.7;
const SYMBOL_SUBSTRING: f32 = 0.6;
const PATH_SUBSTRING: f32 = 0.5;

/// What part of a file matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// The file name.
    Filename,
    /// A top-level symbol.
    Symbol,
    /// A directory below the index root.
    Path,
}

/// One lookup result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickMatch {
    pub path: String,
    /// Matched symbol name, for symbol matches.
    pub symbol: Option<String>,
    /// Structural kind of the matched symbol.
    pub kind: Option<ChunkKind>,
    /// 1-based line of the matched symbol.
    pub line: Option<usize>,
    pub language: Language,
    pub score: f32,
    pub match_kind: MatchKind,
}

/// Options for [`QuickIndex::lookup_with`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupOptions {
    /// Maximum number of matches.
    pub limit: usize,

    /// Only these languages (empty = any).
    pub languages: Vec<Language>,

    /// Only files modified within this many days.
    pub recent_days: Option<u32>,
}

impl LookupOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_languages(mut self, languages: Vec<Language>) -> Self {
        self.languages = languages;
        self
    }

    pub fn with_recent_days(mut self, days: u32) -> Self {
        self.recent_days = Some(days);
        self
    }
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LOOKUP_LIMIT,
            languages: Vec::new(),
            recent_days: None,
        }
    }
}

#[derive(Debug, Clone)]
struct IndexedSymbol {
    symbol: Symbol,
    lower: String,
}

#[derive(Debug, Clone)]
struct IndexedFile {
    path: String,
    /// Lowercased path relative to its index root.
    relative_lower: String,
    name_lower: String,
    stem_lower: String,
    language: Language,
    modified: DateTime<Utc>,
    symbols: Vec<IndexedSymbol>,
}

impl IndexedFile {
    fn new(record: FileRecord, symbols: Vec<Symbol>, roots: &[String]) -> Self {
        let name_lower = record.file_name().to_lowercase();
        let stem_lower = match name_lower.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name_lower.clone(),
        };
        Self {
            relative_lower: relative_path(&record.path, roots).to_lowercase(),
            name_lower,
            stem_lower,
            language: record.language,
            modified: record.modified,
            symbols: symbols
                .into_iter()
                .map(|symbol| IndexedSymbol {
                    lower: symbol.name.to_lowercase(),
                    symbol,
                })
                .collect(),
            path: record.path,
        }
    }

    fn file_score(&self, term: &str) -> Option<(f32, MatchKind)> {
        if self.stem_lower == term || self.name_lower == term {
            Some((STEM_EXACT, MatchKind::Filename))
        } else if self.stem_lower.starts_with(term) {
            Some((STEM_PREFIX, MatchKind::Filename))
        } else if self.name_lower.contains(term) {
            Some((STEM_SUBSTRING, MatchKind::Filename))
        } else if self.relative_lower.contains(term) {
            Some((PATH_SUBSTRING, MatchKind::Path))
        } else {
            None
        }
    }

    fn file_match(&self, score: f32, match_kind: MatchKind) -> QuickMatch {
        QuickMatch {
            path: self.path.clone(),
            symbol: None,
            kind: None,
            line: None,
            language: self.language,
            score,
            match_kind,
        }
    }

    fn symbol_match(&self, symbol: &Symbol, score: f32) -> QuickMatch {
        QuickMatch {
            path: self.path.clone(),
            symbol: Some(symbol.name.clone()),
            kind: Some(symbol.kind),
            line: Some(symbol.line),
            language: self.language,
            score,
            match_kind: MatchKind::Symbol,
        }
    }
}

fn symbol_score(symbol: &str, term: &str) -> Option<f32> {
    if symbol == term {
        Some(SYMBOL_EXACT)
    } else if symbol.starts_with(term) {
        Some(SYMBOL_PREFIX)
    } else if symbol.contains(term) {
        Some(SYMBOL_SUBSTRING)
    } else {
        None
    }
}

/// Filename and symbol lookup table.
#[derive(Debug, Clone, Default)]
pub struct QuickIndex {
    files: Vec<IndexedFile>,
    symbol_count: usize,
}

impl QuickIndex {
    /// An index with no files.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from scan records and the symbols found in each file.
    ///
    /// Path matches only consider the part of each path below the deepest of
    /// `roots` containing it.
    pub fn build_from_files(
        files: impl IntoIterator<Item = (FileRecord, Vec<Symbol>)>,
        roots: &[String],
    ) -> Self {
        let mut files: Vec<IndexedFile> = files
            .into_iter()
            .map(|(record, symbols)| IndexedFile::new(record, symbols, roots))
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let symbol_count = files.iter().map(|f| f.symbols.len()).sum();
        Self {
            files,
            symbol_count,
        }
    }

    /// Number of indexed files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of indexed symbols.
    pub fn symbol_count(&self) -> usize {
        self.symbol_count
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Look up `term` with default options.
    pub fn lookup(&self, term: &str) -> Vec<QuickMatch> {
        self.lookup_with(term, &LookupOptions::default(), Utc::now())
    }

    /// Look up `term`, filtering relative to `now`.
    pub fn lookup_with(
        &self,
        term: &str,
        options: &LookupOptions,
        now: DateTime<Utc>,
    ) -> Vec<QuickMatch> {
        let term = term.trim().to_lowercase();
        if term.is_empty() || options.limit == 0 {
            return Vec::new();
        }
        let cutoff = options
            .recent_days
            .map(|days| now - Duration::days(i64::from(days)));

        let mut matches = Vec::new();
        for file in &self.files {
            if !options.languages.is_empty() && !options.languages.contains(&file.language) {
                continue;
            }
            if cutoff.is_some_and(|cutoff| file.modified < cutoff) {
                continue;
            }
            if let Some((score, kind)) = file.file_score(&term) {
                matches.push(file.file_match(score, kind));
            }
            for symbol in &file.symbols {
                if let Some(score) = symbol_score(&symbol.lower, &term) {
                    matches.push(file.symbol_match(&symbol.symbol, score));
                }
            }
        }

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.line.unwrap_or(0).cmp(&b.line.unwrap_or(0)))
        });
        matches.truncate(options.limit);
        matches
    }
}
