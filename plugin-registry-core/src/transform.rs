//! Source rewrite transform: detach a plugin module from its SDK base class.
//!
//! Works on a tree-sitter syntax tree, never on raw text patterns, so the words
//! `extends`, `super(` and `import` inside strings, template literals and
//! comments are left alone. Three kinds of node are removed:
//!
//! - the `extends` clause of every class (an `implements` clause is kept),
//! - every expression statement that only calls `super(...)`,
//! - every top-level `import` statement.
//!
//! Everything else is copied through byte for byte, so the transform is
//! idempotent.

use std::path::Path;
use tracing::debug;
use tree_sitter::{Node, Parser, Tree};

use crate::error::{CompileError, Diagnostic};

/// Holds one parser per grammar; reuse it across files.
pub struct SourceParser {
    typescript: Parser,
    tsx: Parser,
}

impl SourceParser {
    pub fn new() -> Result<Self, CompileError> {
        let mut typescript = Parser::new();
        typescript
            .set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into())
            .map_err(|e| parser_setup_error("typescript", e))?;
        let mut tsx = Parser::new();
        tsx.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into())
            .map_err(|e| parser_setup_error("tsx", e))?;
        Ok(Self { typescript, tsx })
    }

    /// Parse `source`, rejecting trees that contain syntax errors.
    pub fn parse(&mut self, path: &Path, source: &str) -> Result<Tree, Diagnostic> {
        let parser = match path.extension().and_then(|e| e.to_str()) {
            Some("tsx") | Some("jsx") => &mut self.tsx,
            _ => &mut self.typescript,
        };
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| Diagnostic::for_file(path, "parser produced no syntax tree"))?;

        let root = tree.root_node();
        if root.has_error() {
            let diagnostic = match first_error(root) {
                Some(node) => {
                    let pos = node.start_position();
                    let message = if node.is_missing() {
                        format!("syntax error: missing `{}`", node.kind())
                    } else {
                        "syntax error".to_string()
                    };
                    Diagnostic::for_file(path, message).at(pos.row + 1, pos.column + 1)
                }
                None => Diagnostic::for_file(path, "syntax error"),
            };
            return Err(diagnostic);
        }
        Ok(tree)
    }
}

fn parser_setup_error(grammar: &str, e: tree_sitter::LanguageError) -> CompileError {
    CompileError::Diagnostics(vec![Diagnostic {
        file: None,
        line: None,
        column: None,
        message: format!("failed to load {grammar} grammar: {e}"),
    }])
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error())
        .find_map(first_error)
}

/// Apply the rewrite to an already parsed `source`.
pub fn rewrite(tree: &Tree, source: &str) -> String {
    let bytes = source.as_bytes();
    let mut removals: Vec<(usize, usize)> = Vec::new();
    let root = tree.root_node();

    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        if child.kind() == "import_statement" {
            removals.push(widen_to_line(bytes, child.start_byte(), child.end_byte()));
        }
    }

    let mut clauses = Vec::new();
    descendants_of_kind(root, "extends_clause", &mut clauses);
    for clause in clauses {
        removals.push(eat_trailing_blanks(bytes, clause.start_byte(), clause.end_byte()));
    }

    let mut statements = Vec::new();
    descendants_of_kind(root, "expression_statement", &mut statements);
    for stmt in statements.into_iter().filter(|s| is_super_call(*s)) {
        removals.push(widen_to_line(bytes, stmt.start_byte(), stmt.end_byte()));
    }

    debug!(removals = removals.len(), "Applying source rewrite");
    apply_removals(source, removals)
}

/// Parse and rewrite in one step.
pub fn rewrite_source(
    parser: &mut SourceParser,
    path: &Path,
    source: &str,
) -> Result<String, Diagnostic> {
    let tree = parser.parse(path, source)?;
    Ok(rewrite(&tree, source))
}

pub(crate) fn descendants_of_kind<'t>(node: Node<'t>, kind: &str, out: &mut Vec<Node<'t>>) {
    if node.kind() == kind {
        out.push(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        descendants_of_kind(child, kind, out);
    }
}

fn is_super_call(stmt: Node<'_>) -> bool {
    let Some(expr) = stmt.named_child(0) else {
        return false;
    };
    if expr.kind() != "call_expression" {
        return false;
    }
    expr.child_by_field_name("function")
        .is_some_and(|f| f.kind() == "super")
}

/// Grow a removal to the full line when the node is alone on its line(s).
fn widen_to_line(bytes: &[u8], start: usize, end: usize) -> (usize, usize) {
    let mut line_start = start;
    while line_start > 0 && matches!(bytes[line_start - 1], b' ' | b'\t') {
        line_start -= 1;
    }
    let alone_at_start = line_start == 0 || bytes[line_start - 1] == b'\n';

    let mut line_end = end;
    while line_end < bytes.len() && matches!(bytes[line_end], b' ' | b'\t' | b'\r') {
        line_end += 1;
    }
    let alone_at_end = line_end == bytes.len() || bytes[line_end] == b'\n';

    if alone_at_start && alone_at_end {
        let end = if line_end < bytes.len() { line_end + 1 } else { line_end };
        (line_start, end)
    } else {
        eat_trailing_blanks(bytes, start, end)
    }
}

fn eat_trailing_blanks(bytes: &[u8], start: usize, end: usize) -> (usize, usize) {
    let mut end = end;
    while end < bytes.len() && matches!(bytes[end], b' ' | b'\t') {
        end += 1;
    }
    (start, end)
}

fn apply_removals(source: &str, mut removals: Vec<(usize, usize)>) -> String {
    removals.sort_unstable();
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for (start, end) in removals {
        if end <= cursor {
            continue;
        }
        let start = start.max(cursor);
        out.push_str(&source[cursor..start]);
        cursor = end;
    }
    out.push_str(&source[cursor..]);
    out
}
