//! Chunking strategies, one per language family.

use std::path::Path;
use std::sync::Arc;

use compass_change_detector::Language;
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkKind;
use crate::error::Result;
use crate::markdown::MarkdownStrategy;
use crate::syntax::SyntaxStrategy;

/// A top-level structural unit found by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralUnit {
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub start_byte: usize,
    pub end_byte: usize,
    /// Ancestor heading path (markdown only).
    pub context: Option<String>,
}

/// A named unit as exposed to the quick index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: ChunkKind,
    /// 1-based line of the unit's first line.
    pub line: usize,
}

/// Capability interface implemented by every chunking strategy.
pub trait LanguageStrategy: Send + Sync {
    /// Whether this strategy handles files at `path`.
    fn detect_language(&self, path: &Path) -> Option<Language>;

    /// Top-level units in source order. An empty result means the file has
    /// no structure and is chunked as a whole or windowed.
    fn structural_boundaries(&self, content: &str) -> Result<Vec<StructuralUnit>>;
}

/// Strategy for content without a structural parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackStrategy;

impl LanguageStrategy for FallbackStrategy {
    fn detect_language(&self, path: &Path) -> Option<Language> {
        Some(Language::from_path(path))
    }

    fn structural_boundaries(&self, _content: &str) -> Result<Vec<StructuralUnit>> {
        Ok(Vec::new())
    }
}

/// Selects a strategy by language tag.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: Vec<(Language, Arc<dyn LanguageStrategy>)>,
    fallback: Arc<dyn LanguageStrategy>,
}

impl StrategyRegistry {
    /// Registry with every built-in strategy.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for language in [
            Language::Python,
            Language::Rust,
            Language::JavaScript,
            Language::TypeScript,
            Language::Go,
        ] {
            if let Some(strategy) = SyntaxStrategy::for_language(language) {
                registry.register(language, Arc::new(strategy));
            }
        }
        registry.register(Language::Markdown, Arc::new(MarkdownStrategy::new()));
        registry
    }

    /// Registry that windows everything.
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
            fallback: Arc::new(FallbackStrategy),
        }
    }

    /// Register or replace the strategy for a language.
    pub fn register(&mut self, language: Language, strategy: Arc<dyn LanguageStrategy>) {
        self.strategies.retain(|(lang, _)| *lang != language);
        self.strategies.push((language, strategy));
    }

    /// The strategy for a language tag.
    pub fn for_language(&self, language: Language) -> &dyn LanguageStrategy {
        self.strategies
            .iter()
            .find(|(lang, _)| *lang == language)
            .map_or(self.fallback.as_ref(), |(_, s)| s.as_ref())
    }

    /// Detect the language of a path, asking registered strategies first.
    pub fn detect_language(&self, path: &Path) -> Language {
        self.strategies
            .iter()
            .find_map(|(_, s)| s.detect_language(path))
            .unwrap_or_else(|| Language::from_path(path))
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let languages: Vec<Language> = self.strategies.iter().map(|(l, _)| *l).collect();
        f.debug_struct("StrategyRegistry")
            .field("languages", &languages)
            .finish()
    }
}

/// Byte offset to line number lookup.
#[derive(Debug, Clone)]
pub(crate) struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    /// 1-based line containing `byte`.
    pub(crate) fn line_of(&self, byte: usize) -> usize {
        match self.starts.binary_search(&byte) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// 1-based line of the last byte in `[start, end)`.
    pub(crate) fn last_line(&self, start: usize, end: usize) -> usize {
        self.line_of(end.saturating_sub(1).max(start))
    }
}
