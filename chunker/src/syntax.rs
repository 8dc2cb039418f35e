//! Tree-sitter backed strategies for source code.
//!
//! Only top-level definitions become units. Leading comments, attributes and
//! decorators directly above a definition are folded into its unit.

use std::path::Path;

use compass_change_detector::Language;
use tree_sitter::{Node, Parser, Tree};

use crate::chunk::ChunkKind;
use crate::error::{ChunkError, Result};
use crate::strategy::{LanguageStrategy, StructuralUnit};

/// Structural strategy for one tree-sitter grammar.
pub struct SyntaxStrategy {
    language: Language,
    grammar: tree_sitter::Language,
    /// Tried when the primary grammar reports syntax errors (TSX).
    alternate: Option<tree_sitter::Language>,
}

impl SyntaxStrategy {
    /// Strategy for a language, if a grammar is bundled for it.
    pub fn for_language(language: Language) -> Option<Self> {
        let (grammar, alternate): (tree_sitter::Language, Option<tree_sitter::Language>) =
            match language {
                Language::Python => (tree_sitter_python::LANGUAGE.into(), None),
                Language::Rust => (tree_sitter_rust::LANGUAGE.into(), None),
                Language::JavaScript => (tree_sitter_javascript::LANGUAGE.into(), None),
                Language::TypeScript => (
                    tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
                    Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
                ),
                Language::Go => (tree_sitter_go::LANGUAGE.into(), None),
                _ => return None,
            };
        Some(Self {
            language,
            grammar,
            alternate,
        })
    }

    fn parse_with(&self, grammar: &tree_sitter::Language, content: &str) -> Result<Tree> {
        let mut parser = Parser::new();
        parser
            .set_language(grammar)
            .map_err(|e| ChunkError::Grammar(format!("{}: {e}", self.language)))?;
        let tree = parser
            .parse(content, None)
            .ok_or_else(|| ChunkError::Parse(format!("{} parser returned no tree", self.language)))?;
        if tree.root_node().has_error() {
            return Err(ChunkError::Parse(format!(
                "{} source contains syntax errors",
                self.language
            )));
        }
        Ok(tree)
    }

    fn parse(&self, content: &str) -> Result<Tree> {
        match (self.parse_with(&self.grammar, content), &self.alternate) {
            (Ok(tree), _) => Ok(tree),
            (Err(_), Some(alternate)) => self.parse_with(alternate, content),
            (Err(e), None) => Err(e),
        }
    }

    fn is_leading_trivia(&self, kind: &str) -> bool {
        match self.language {
            Language::Rust => matches!(kind, "line_comment" | "block_comment" | "attribute_item"),
            _ => kind == "comment",
        }
    }

    fn classify(&self, node: Node<'_>, src: &[u8]) -> Option<(ChunkKind, Option<String>)> {
        match self.language {
            Language::Python => classify_python(node, src),
            Language::Rust => classify_rust(node, src),
            Language::JavaScript => classify_js(node, src),
            Language::TypeScript => classify_ts(node, src),
            Language::Go => classify_go(node, src),
            _ => None,
        }
    }
}

impl LanguageStrategy for SyntaxStrategy {
    fn detect_language(&self, path: &Path) -> Option<Language> {
        let detected = Language::from_path(path);
        (detected == self.language).then_some(detected)
    }

    fn structural_boundaries(&self, content: &str) -> Result<Vec<StructuralUnit>> {
        let tree = self.parse(content)?;
        let root = tree.root_node();
        let src = content.as_bytes();

        let mut units = Vec::new();
        // (start byte, last row) of the current run of comments and attributes.
        let mut leading: Option<(usize, usize)> = None;

        let mut cursor = root.walk();
        for node in root.children(&mut cursor) {
            let row = node.start_position().row;
            let adjacent = |run: Option<(usize, usize)>| run.filter(|(_, end_row)| row <= end_row + 1);

            if self.is_leading_trivia(node.kind()) {
                leading = Some(match adjacent(leading) {
                    Some((start, _)) => (start, node.end_position().row),
                    None => (node.start_byte(), node.end_position().row),
                });
                continue;
            }

            if let Some((kind, name)) = self.classify(node, src) {
                let start_byte = adjacent(leading).map_or(node.start_byte(), |(start, _)| start);
                units.push(StructuralUnit {
                    kind,
                    name,
                    start_byte,
                    end_byte: node.end_byte(),
                    context: None,
                });
            }
            leading = None;
        }

        Ok(units)
    }
}

fn text_of(node: Node<'_>, src: &[u8]) -> Option<String> {
    node.utf8_text(src).ok().map(str::to_string)
}

fn field_text(node: Node<'_>, field: &str, src: &[u8]) -> Option<String> {
    node.child_by_field_name(field).and_then(|n| text_of(n, src))
}

fn classify_python(node: Node<'_>, src: &[u8]) -> Option<(ChunkKind, Option<String>)> {
    match node.kind() {
        "function_definition" => Some((ChunkKind::Function, field_text(node, "name", src))),
        "class_definition" => Some((ChunkKind::Class, field_text(node, "name", src))),
        "decorated_definition" => node
            .child_by_field_name("definition")
            .and_then(|def| classify_python(def, src)),
        _ => None,
    }
}

fn classify_rust(node: Node<'_>, src: &[u8]) -> Option<(ChunkKind, Option<String>)> {
    match node.kind() {
        "function_item" | "macro_definition" => {
            Some((ChunkKind::Function, field_text(node, "name", src)))
        }
        "struct_item" | "enum_item" | "union_item" | "trait_item" => {
            Some((ChunkKind::Class, field_text(node, "name", src)))
        }
        // `mod foo;` declares a file, it has no body to index.
        "mod_item" => node
            .child_by_field_name("body")
            .map(|_| (ChunkKind::Class, field_text(node, "name", src))),
        "impl_item" => Some((ChunkKind::Class, field_text(node, "type", src))),
        _ => None,
    }
}

fn classify_js(node: Node<'_>, src: &[u8]) -> Option<(ChunkKind, Option<String>)> {
    match node.kind() {
        "function_declaration" | "generator_function_declaration" => {
            Some((ChunkKind::Function, field_text(node, "name", src)))
        }
        "class_declaration" => Some((ChunkKind::Class, field_text(node, "name", src))),
        "lexical_declaration" | "variable_declaration" => classify_declarator(node, src),
        "export_statement" => {
            if let Some(declaration) = node.child_by_field_name("declaration") {
                return classify_js(declaration, src).or_else(|| classify_ts(declaration, src));
            }
            let value = node.child_by_field_name("value")?;
            let kind = match value.kind() {
                "function_expression" | "arrow_function" | "function" => ChunkKind::Function,
                "class" => ChunkKind::Class,
                _ => return None,
            };
            let name = field_text(value, "name", src).or_else(|| Some("default".to_string()));
            Some((kind, name))
        }
        _ => None,
    }
}

/// `const handler = () => {}` and friends.
fn classify_declarator(node: Node<'_>, src: &[u8]) -> Option<(ChunkKind, Option<String>)> {
    let mut cursor = node.walk();
    let declarator = node
        .named_children(&mut cursor)
        .find(|child| child.kind() == "variable_declarator")?;
    let kind = match declarator.child_by_field_name("value")?.kind() {
        "arrow_function" | "function_expression" | "function" | "generator_function" => {
            ChunkKind::Function
        }
        "class" => ChunkKind::Class,
        _ => return None,
    };
    Some((kind, field_text(declarator, "name", src)))
}

fn classify_ts(node: Node<'_>, src: &[u8]) -> Option<(ChunkKind, Option<String>)> {
    match node.kind() {
        "interface_declaration" | "enum_declaration" | "abstract_class_declaration" => {
            Some((ChunkKind::Class, field_text(node, "name", src)))
        }
        _ => classify_js(node, src),
    }
}

fn classify_go(node: Node<'_>, src: &[u8]) -> Option<(ChunkKind, Option<String>)> {
    match node.kind() {
        "function_declaration" | "method_declaration" => {
            Some((ChunkKind::Function, field_text(node, "name", src)))
        }
        "type_declaration" => {
            let mut cursor = node.walk();
            let name = node
                .named_children(&mut cursor)
                .find(|child| child.kind() == "type_spec")
                .and_then(|spec| field_text(spec, "name", src));
            Some((ChunkKind::Class, name))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn units(language: Language, content: &str) -> Vec<(ChunkKind, Option<String>, String)> {
        let strategy = SyntaxStrategy::for_language(language).unwrap();
        strategy
            .structural_boundaries(content)
            .unwrap()
            .into_iter()
            .map(|u| (u.kind, u.name, content[u.start_byte..u.end_byte].to_string()))
            .collect()
    }

    #[test]
    fn test_python_functions_and_decorators() {
        let source = "import os\n\n# helper\n@cache\ndef load(path):\n    return path\n\nclass Store:\n    def get(self):\n        pass\n";
        let found = units(Language::Python, source);

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, ChunkKind::Function);
        assert_eq!(found[0].1.as_deref(), Some("load"));
        assert!(found[0].2.starts_with("# helper\n@cache\ndef load"));
        assert_eq!(found[1].0, ChunkKind::Class);
        assert_eq!(found[1].1.as_deref(), Some("Store"));
    }

    #[test]
    fn test_rust_items() {
        let source = "use std::fmt;\n\n/// A point.\n#[derive(Debug)]\npub struct Point { x: i32 }\n\nimpl Point {\n    fn x(&self) -> i32 { self.x }\n}\n\nmod util;\n\nfn main() {}\n";
        let found = units(Language::Rust, source);
        let names: Vec<(ChunkKind, Option<&str>)> =
            found.iter().map(|(k, n, _)| (*k, n.as_deref())).collect();

        assert_eq!(
            names,
            vec![
                (ChunkKind::Class, Some("Point")),
                (ChunkKind::Class, Some("Point")),
                (ChunkKind::Function, Some("main")),
            ]
        );
        assert!(found[0].2.starts_with("/// A point.\n#[derive(Debug)]"));
    }

    #[test]
    fn test_javascript_exports_and_arrows() {
        let source = "export function render() {}\nconst handler = () => 1;\nexport default class App {}\n";
        let found = units(Language::JavaScript, source);
        let names: Vec<Option<&str>> = found.iter().map(|(_, n, _)| n.as_deref()).collect();
        assert_eq!(names, vec![Some("render"), Some("handler"), Some("App")]);
    }

    #[test]
    fn test_typescript_interfaces() {
        let source = "export interface User { id: number }\nfunction greet(u: User): string { return `${u.id}`; }\n";
        let found = units(Language::TypeScript, source);
        assert_eq!(found[0].0, ChunkKind::Class);
        assert_eq!(found[0].1.as_deref(), Some("User"));
        assert_eq!(found[1].1.as_deref(), Some("greet"));
    }

    #[test]
    fn test_go_declarations() {
        let source = "package main\n\ntype Server struct{}\n\nfunc (s *Server) Run() {}\n\nfunc main() {}\n";
        let found = units(Language::Go, source);
        let names: Vec<Option<&str>> = found.iter().map(|(_, n, _)| n.as_deref()).collect();
        assert_eq!(names, vec![Some("Server"), Some("Run"), Some("main")]);
    }

    #[test]
    fn test_syntax_errors_are_reported() {
        let strategy = SyntaxStrategy::for_language(Language::Python).unwrap();
        let err = strategy.structural_boundaries("def broken(:\n").unwrap_err();
        assert!(matches!(err, ChunkError::Parse(_)));
    }
}
