//! Heading-based strategy for markdown.

use std::path::Path;

use compass_change_detector::Language;
use regex_lite::Regex;

use crate::chunk::ChunkKind;
use crate::error::Result;
use crate::strategy::{LanguageStrategy, StructuralUnit};

/// Separator between ancestor headings in a section's context.
const BREADCRUMB_SEPARATOR: &str = " > ";

/// Splits markdown into one section per ATX heading.
///
/// Each section runs from its heading to the next heading of any level and
/// carries the titles of its ancestor headings as context. Text before the
/// first heading becomes an untitled section. Headings inside fenced code
/// blocks are ignored.
#[derive(Debug, Clone)]
pub struct MarkdownStrategy {
    heading: Option<Regex>,
}

impl MarkdownStrategy {
    pub fn new() -> Self {
        Self {
            heading: Regex::new(r"^ {0,3}(#{1,6})[ \t]+(.*?)[ \t#]*$").ok(),
        }
    }

    /// (level, title) of a heading line.
    fn parse_heading(&self, line: &str) -> Option<(usize, String)> {
        let caps = self.heading.as_ref()?.captures(line)?;
        let level = caps.get(1)?.as_str().len();
        let title = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
        Some((level, title))
    }
}

impl Default for MarkdownStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageStrategy for MarkdownStrategy {
    fn detect_language(&self, path: &Path) -> Option<Language> {
        (Language::from_path(path) == Language::Markdown).then_some(Language::Markdown)
    }

    fn structural_boundaries(&self, content: &str) -> Result<Vec<StructuralUnit>> {
        // (byte offset, level, title) of every heading outside code fences.
        let mut headings = Vec::new();
        let mut fence: Option<&str> = None;
        let mut offset = 0;

        for line in content.split_inclusive('\n') {
            let trimmed = line.trim_start();
            let marker = ["```", "~~~"].into_iter().find(|m| trimmed.starts_with(m));
            match (fence, marker) {
                (None, Some(m)) => fence = Some(m),
                (Some(open), Some(m)) if open == m => fence = None,
                (None, None) => {
                    if let Some((level, title)) = self.parse_heading(line.trim_end()) {
                        headings.push((offset, level, title));
                    }
                }
                _ => {}
            }
            offset += line.len();
        }

        if headings.is_empty() {
            return Ok(Vec::new());
        }

        let mut units = Vec::new();
        if let Some(&(first, _, _)) = headings.first() {
            if !content[..first].trim().is_empty() {
                units.push(StructuralUnit {
                    kind: ChunkKind::Section,
                    name: None,
                    start_byte: 0,
                    end_byte: first,
                    context: None,
                });
            }
        }

        // Titles of the open ancestors, indexed by level - 1.
        let mut stack: Vec<(usize, String)> = Vec::new();
        for (i, (start, level, title)) in headings.iter().enumerate() {
            while stack.last().is_some_and(|(l, _)| l >= level) {
                stack.pop();
            }
            let context = (!stack.is_empty()).then(|| {
                stack
                    .iter()
                    .map(|(_, t)| t.as_str())
                    .collect::<Vec<_>>()
                    .join(BREADCRUMB_SEPARATOR)
            });
            let end = headings.get(i + 1).map_or(content.len(), |(next, _, _)| *next);
            units.push(StructuralUnit {
                kind: ChunkKind::Section,
                name: (!title.is_empty()).then(|| title.clone()),
                start_byte: *start,
                end_byte: end,
                context,
            });
            stack.push((*level, title.clone()));
        }

        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sections_carry_ancestor_headings() {
        let doc = "# Guide\nIntro.\n\n## Install\nRun it.\n\n### Linux\napt.\n\n## Usage\nUse it.\n";
        let units = MarkdownStrategy::new().structural_boundaries(doc).unwrap();

        let summary: Vec<(Option<&str>, Option<&str>)> = units
            .iter()
            .map(|u| (u.name.as_deref(), u.context.as_deref()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Some("Guide"), None),
                (Some("Install"), Some("Guide")),
                (Some("Linux"), Some("Guide > Install")),
                (Some("Usage"), Some("Guide")),
            ]
        );
        assert_eq!(&doc[units[2].start_byte..units[2].end_byte], "### Linux\napt.\n\n");
    }

    #[test]
    fn test_preamble_and_code_fences() {
        let doc = "Some preamble.\n\n# Title\n```sh\n# not a heading\n```\n";
        let units = MarkdownStrategy::new().structural_boundaries(doc).unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, None);
        assert_eq!(units[0].end_byte, 16);
        assert_eq!(units[1].name.as_deref(), Some("Title"));
        assert_eq!(units[1].end_byte, doc.len());
    }

    #[test]
    fn test_no_headings_means_no_units() {
        let units = MarkdownStrategy::new()
            .structural_boundaries("just text\n#hashtag\n")
            .unwrap();
        assert!(units.is_empty());
    }
}
