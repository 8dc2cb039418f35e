//! Why a search result ranked where it did.

use compass_chunker::ChunkKind;
use compass_index::IndexEntry;
use serde::{Deserialize, Serialize};

const HIGH_SIMILARITY: f32 = 0.75;
const MODERATE_SIMILARITY: f32 = 0.5;

/// Qualitative bucket for a similarity value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    High,
    Moderate,
    Low,
}

impl Strength {
    pub fn from_similarity(similarity: f32) -> Self {
        if similarity >= HIGH_SIMILARITY {
            Self::High
        } else if similarity >= MODERATE_SIMILARITY {
            Self::Moderate
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Low => "low",
        }
    }
}

/// Reason why a result matched the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MatchReason {
    /// Vector similarity to the query.
    SemanticSimilarity { similarity: f32, strength: Strength },

    /// Query terms found verbatim in the chunk text.
    ExactTerms { terms: Vec<String> },

    /// Query terms found in the file name.
    FilenameMatch { terms: Vec<String> },

    /// The chunk's symbol name contains a query term.
    SymbolMatch { name: String },

    /// Structural kind of the chunk.
    StructuralKind { kind: ChunkKind },
}

/// Structured explanation attached to each result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub reasons: Vec<MatchReason>,

    /// Distinct query terms found in the text, name or root-relative path.
    pub matched_terms: Vec<String>,

    /// One-line human-readable summary. Never empty.
    pub summary: String,
}

impl Explanation {
    /// Fraction of `terms` that matched.
    pub fn overlap(&self, term_count: usize) -> f32 {
        if term_count == 0 {
            0.0
        } else {
            self.matched_terms.len() as f32 / term_count as f32
        }
    }
}

/// Explain how `entry` relates to the lowercased query `terms`.
///
/// `relative_path` is the entry's path below its index root; directories
/// above the root are not matched.
pub fn explain(
    terms: &[String],
    entry: &IndexEntry,
    similarity: f32,
    relative_path: &str,
) -> Explanation {
    let text = entry.text.to_lowercase();
    let file_name = entry.file_name().to_lowercase();
    let path = relative_path.to_lowercase();
    let name = entry.name.as_deref().map(str::to_lowercase);

    let mut in_text = Vec::new();
    let mut in_file_name = Vec::new();
    let mut matched_terms = Vec::new();
    let mut symbol_hit = false;

    for term in terms {
        let text_hit = text.contains(term.as_str());
        let file_hit = file_name.contains(term.as_str());
        let name_hit = name.as_deref().is_some_and(|n| n.contains(term.as_str()));
        if text_hit {
            in_text.push(term.clone());
        }
        if file_hit {
            in_file_name.push(term.clone());
        }
        symbol_hit |= name_hit;
        if text_hit || name_hit || path.contains(term.as_str()) {
            matched_terms.push(term.clone());
        }
    }

    let strength = Strength::from_similarity(similarity);
    let mut reasons = vec![MatchReason::SemanticSimilarity {
        similarity,
        strength,
    }];
    if !in_text.is_empty() {
        reasons.push(MatchReason::ExactTerms {
            terms: in_text.clone(),
        });
    }
    if !in_file_name.is_empty() {
        reasons.push(MatchReason::FilenameMatch {
            terms: in_file_name.clone(),
        });
    }
    if symbol_hit {
        if let Some(name) = &entry.name {
            reasons.push(MatchReason::SymbolMatch { name: name.clone() });
        }
    }
    reasons.push(MatchReason::StructuralKind { kind: entry.kind });

    let summary = summarize(entry, similarity, strength, &in_text, &in_file_name);
    Explanation {
        reasons,
        matched_terms,
        summary,
    }
}

fn summarize(
    entry: &IndexEntry,
    similarity: f32,
    strength: Strength,
    in_text: &[String],
    in_file_name: &[String],
) -> String {
    let subject = match &entry.name {
        Some(name) if !name.trim().is_empty() => format!("{} `{name}`", entry.kind.as_str()),
        _ => entry.kind.as_str().to_string(),
    };
    let mut summary = format!(
        "{subject} in {}: {} semantic similarity ({similarity:.2})",
        display_name(entry),
        strength.as_str()
    );
    if !in_text.is_empty() {
        summary.push_str(&format!("; contains {}", in_text.join(", ")));
    }
    if !in_file_name.is_empty() {
        summary.push_str(&format!("; file name matches {}", in_file_name.join(", ")));
    }
    summary
}

fn display_name(entry: &IndexEntry) -> &str {
    match entry.file_name() {
        "" => "file",
        name => name,
    }
}
