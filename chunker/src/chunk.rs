//! Chunk types.

use std::fmt;
use std::str::FromStr;

use compass_change_detector::Language;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of characters shown by [`Chunk::preview`].
const PREVIEW_CHARS: usize = 200;

/// Structural kind of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// A function or method.
    Function,
    /// A class, struct, enum, trait, impl block or module body.
    Class,
    /// A markdown section.
    Section,
    /// A sliding window over unstructured text.
    Window,
    /// Top-level code not covered by a structural unit.
    Module,
    /// A small file kept in one piece.
    WholeFile,
}

impl ChunkKind {
    /// Stable tag stored in the metadata store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Section => "section",
            Self::Window => "window",
            Self::Module => "module",
            Self::WholeFile => "whole_file",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "section" => Ok(Self::Section),
            "window" => Ok(Self::Window),
            "module" => Ok(Self::Module),
            "whole_file" => Ok(Self::WholeFile),
            other => Err(format!("unknown chunk kind: {other}")),
        }
    }
}

/// A contiguous piece of a file that is embedded as one vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier: hash of path, sequence and embedded text.
    pub id: String,

    /// Path of the owning file.
    pub path: String,

    /// Position within the file, starting at 0.
    pub sequence: u32,

    /// Structural kind.
    pub kind: ChunkKind,

    /// Function, class or heading name.
    pub name: Option<String>,

    /// First line, 1-based.
    pub start_line: usize,

    /// Last line, 1-based and inclusive.
    pub end_line: usize,

    /// Byte offset of the first byte.
    pub start_byte: usize,

    /// Byte offset one past the last byte.
    pub end_byte: usize,

    /// Raw text of the chunk.
    pub text: String,

    /// Ancestor heading path for markdown sections.
    pub context: Option<String>,

    /// Language of the owning file.
    pub language: Language,
}

impl Chunk {
    /// Text sent to the embedding provider.
    pub fn embedding_text(&self) -> String {
        embedding_text(self.context.as_deref(), &self.text)
    }

    /// Estimated token count of the chunk text.
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }

    /// First characters of the text, for display.
    pub fn preview(&self) -> String {
        let trimmed = self.text.trim();
        let mut preview: String = trimmed.chars().take(PREVIEW_CHARS).collect();
        if trimmed.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }
        preview
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub(crate) fn embedding_text(context: Option<&str>, text: &str) -> String {
    match context {
        Some(context) => format!("{context}\n\n{text}"),
        None => text.to_string(),
    }
}

/// Deterministic chunk identifier.
pub fn chunk_id(path: &str, sequence: u32, embedded_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(sequence.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(embedded_text.as_bytes());
    format!("{:x}", hasher.finalize())
}
