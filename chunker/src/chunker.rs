//! The chunker: turns file content into an ordered sequence of chunks.

use std::path::Path;

use compass_change_detector::{Language, is_binary};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::{Chunk, ChunkKind, chunk_id, embedding_text, estimate_tokens};
use crate::error::{ChunkError, Result};
use crate::strategy::{LineIndex, StrategyRegistry, StructuralUnit, Symbol};
use crate::window::line_spans;

/// Characters per estimated token.
const CHARS_PER_TOKEN: usize = 4;

/// Configuration for the chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Maximum chunk size in tokens.
    pub max_tokens: usize,

    /// Overlap between consecutive windows in tokens.
    pub overlap_tokens: usize,
}

impl ChunkerConfig {
    /// Set the maximum chunk size.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the window overlap.
    pub fn with_overlap_tokens(mut self, overlap_tokens: usize) -> Self {
        self.overlap_tokens = overlap_tokens;
        self
    }

    fn max_chars(&self) -> usize {
        self.max_tokens.max(1) * CHARS_PER_TOKEN
    }

    fn overlap_chars(&self) -> usize {
        // Never overlap a whole window, or windows would not advance.
        (self.overlap_tokens * CHARS_PER_TOKEN).min(self.max_chars() / 2)
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 64,
        }
    }
}

/// A region of the file that becomes one chunk.
struct Piece {
    kind: ChunkKind,
    name: Option<String>,
    context: Option<String>,
    start: usize,
    end: usize,
}

/// Language-aware chunker.
///
/// Structured files are chunked at top-level definitions (or headings for
/// markdown), oversize units are split at line boundaries and code between
/// units becomes `module` chunks. Files without structure are kept whole
/// when small and windowed otherwise. Output is fully deterministic.
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
    registry: StrategyRegistry,
}

impl Chunker {
    /// Create a chunker with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chunker with custom configuration.
    pub fn with_config(config: ChunkerConfig) -> Self {
        Self {
            config,
            registry: StrategyRegistry::new(),
        }
    }

    /// Replace the strategy registry.
    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The chunker configuration.
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Language of a path as seen by the registered strategies.
    pub fn detect_language(&self, path: &Path) -> Language {
        self.registry.detect_language(path)
    }

    /// Chunk raw file content.
    ///
    /// Binary or non UTF-8 content is rejected with
    /// [`ChunkError::Unsupported`]; empty content yields no chunks.
    pub fn chunk(&self, path: &str, content: &[u8], language: Language) -> Result<Vec<Chunk>> {
        if is_binary(content) {
            return Err(ChunkError::Unsupported("binary content".to_string()));
        }
        let text = std::str::from_utf8(content)
            .map_err(|e| ChunkError::Unsupported(format!("invalid utf-8: {e}")))?;
        Ok(self.chunk_text(path, text, language))
    }

    /// Chunk decoded text.
    pub fn chunk_text(&self, path: &str, text: &str, language: Language) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let strategy = self.registry.for_language(language);
        let pieces = match strategy.structural_boundaries(text) {
            Ok(units) if units.is_empty() => self.unstructured(text),
            Ok(units) => self.structured(text, units),
            Err(e) => {
                debug!("Windowing {path}: {e}");
                self.windows(text, 0, text.len())
            }
        };

        self.assemble(path, text, language, pieces)
    }

    /// Names, kinds and lines of the top-level units, without chunk text.
    pub fn symbols(&self, content: &str, language: Language) -> Vec<Symbol> {
        let Ok(units) = self.registry.for_language(language).structural_boundaries(content) else {
            return Vec::new();
        };
        let lines = LineIndex::new(content);
        units
            .into_iter()
            .filter_map(|unit| {
                let line = lines.line_of(unit.start_byte);
                unit.name.map(|name| Symbol {
                    name,
                    kind: unit.kind,
                    line,
                })
            })
            .collect()
    }

    fn unstructured(&self, text: &str) -> Vec<Piece> {
        if estimate_tokens(text) <= self.config.max_tokens {
            vec![Piece {
                kind: ChunkKind::WholeFile,
                name: None,
                context: None,
                start: 0,
                end: text.len(),
            }]
        } else {
            self.windows(text, 0, text.len())
        }
    }

    fn windows(&self, text: &str, start: usize, end: usize) -> Vec<Piece> {
        line_spans(
            text,
            start,
            end,
            self.config.max_chars(),
            self.config.overlap_chars(),
        )
        .into_iter()
        .map(|(start, end)| Piece {
            kind: ChunkKind::Window,
            name: None,
            context: None,
            start,
            end,
        })
        .collect()
    }

    fn structured(&self, text: &str, mut units: Vec<StructuralUnit>) -> Vec<Piece> {
        units.sort_by_key(|u| (u.start_byte, u.end_byte));

        let mut pieces = Vec::new();
        let mut cursor = 0;
        for unit in units {
            let start = unit.start_byte.max(cursor);
            if start >= unit.end_byte {
                continue;
            }
            self.push_split(text, cursor, start, ChunkKind::Module, None, None, &mut pieces);
            self.push_split(
                text,
                start,
                unit.end_byte,
                unit.kind,
                unit.name,
                unit.context,
                &mut pieces,
            );
            cursor = unit.end_byte;
        }
        self.push_split(text, cursor, text.len(), ChunkKind::Module, None, None, &mut pieces);
        pieces
    }

    /// Push `text[start..end]` as one piece, or several when over budget.
    #[allow(clippy::too_many_arguments)]
    fn push_split(
        &self,
        text: &str,
        start: usize,
        end: usize,
        kind: ChunkKind,
        name: Option<String>,
        context: Option<String>,
        pieces: &mut Vec<Piece>,
    ) {
        if start >= end || text[start..end].trim().is_empty() {
            return;
        }
        if estimate_tokens(&text[start..end]) <= self.config.max_tokens {
            pieces.push(Piece {
                kind,
                name,
                context,
                start,
                end,
            });
            return;
        }
        for (s, e) in line_spans(text, start, end, self.config.max_chars(), 0) {
            pieces.push(Piece {
                kind,
                name: name.clone(),
                context: context.clone(),
                start: s,
                end: e,
            });
        }
    }

    fn assemble(&self, path: &str, text: &str, language: Language, pieces: Vec<Piece>) -> Vec<Chunk> {
        let lines = LineIndex::new(text);
        let mut chunks = Vec::with_capacity(pieces.len());

        for piece in pieces {
            let raw = &text[piece.start..piece.end];
            let leading = raw.len() - raw.trim_start().len();
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            let start = piece.start + leading;
            let end = start + trimmed.len();
            let sequence = chunks.len() as u32;
            let id = chunk_id(path, sequence, &embedding_text(piece.context.as_deref(), trimmed));

            chunks.push(Chunk {
                id,
                path: path.to_string(),
                sequence,
                kind: piece.kind,
                name: piece.name,
                start_line: lines.line_of(start),
                end_line: lines.last_line(start, end),
                start_byte: start,
                end_byte: end,
                text: trimmed.to_string(),
                context: piece.context,
                language,
            });
        }

        chunks
    }
}
