//! # Chunker
//!
//! Splits file content into ordered, deterministically identified chunks.
//!
//! ## Strategies
//!
//! | Language                          | Strategy                         |
//! |-----------------------------------|----------------------------------|
//! | Python, Rust, JS, TypeScript, Go  | tree-sitter top-level units      |
//! | Markdown                          | ATX heading sections             |
//! | everything else                   | whole file, or a sliding window  |
//!
//! ## Example
//!
//! ```rust
//! use compass_change_detector::Language;
//! use compass_chunker::{ChunkKind, Chunker};
//!
//! let chunker = Chunker::new();
//! let chunks = chunker
//!     .chunk("/repo/app.py", b"def main():\n    pass\n", Language::Python)
//!     .unwrap();
//! assert_eq!(chunks[0].kind, ChunkKind::Function);
//! ```

pub mod chunk;
pub mod chunker;
pub mod error;
pub mod markdown;
pub mod strategy;
pub mod syntax;
mod window;

pub use chunk::{Chunk, ChunkKind, chunk_id, estimate_tokens};
pub use chunker::{Chunker, ChunkerConfig};
pub use error::{ChunkError, Result};
pub use markdown::MarkdownStrategy;
pub use strategy::{FallbackStrategy, LanguageStrategy, StrategyRegistry, StructuralUnit, Symbol};
pub use syntax::SyntaxStrategy;
