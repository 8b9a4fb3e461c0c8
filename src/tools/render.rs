//! Text rendering for tool results: relative paths, one-based coordinates,
//! context blocks, and symbol trees.

use std::path::Path;

use lsp_types::{Location, Position, Url};

use crate::index::model::{SymbolNode, SymbolNodeId};

/// Path of `uri` rendered relative to `root`, falling back to the full path.
pub fn rel_display(root: &Path, uri: &Url) -> String {
    match uri.to_file_path() {
        Ok(path) => path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/"),
        Err(()) => uri.to_string(),
    }
}

/// `path:line:col`, one-based.
pub fn location_line(root: &Path, location: &Location) -> String {
    format!(
        "{}:{}:{}",
        rel_display(root, &location.uri),
        location.range.start.line + 1,
        location.range.start.character + 1
    )
}

/// The addressed line plus its neighbors (when they exist), one-based
/// numbers, the addressed line marked.
pub fn context_block(text: &str, line: u32) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let index = line as usize;
    let mut out = String::new();
    let width = (index + 2).to_string().len();
    for neighbor in index.saturating_sub(1)..=(index + 1).min(lines.len().saturating_sub(1)) {
        let marker = if neighbor == index { ">" } else { " " };
        out.push_str(&format!(
            "{} {:>width$} | {}\n",
            marker,
            neighbor + 1,
            lines.get(neighbor).unwrap_or(&""),
        ));
    }
    out
}

/// Single line of a file, for definition previews.
pub fn line_text(text: &str, line: u32) -> Option<&str> {
    text.lines().nth(line as usize)
}

/// One-based "line:col" for messages.
pub fn one_based(position: Position) -> String {
    format!("{}:{}", position.line + 1, position.character + 1)
}

/// Indented tree of a file's symbols with kind tags.
pub fn symbol_tree(nodes: &[SymbolNode], roots: &[SymbolNodeId]) -> String {
    let mut out = String::new();
    for root in roots {
        render_node(nodes, *root, 0, &mut out);
    }
    out
}

fn render_node(nodes: &[SymbolNode], id: SymbolNodeId, depth: usize, out: &mut String) {
    let node = &nodes[id as usize];
    out.push_str(&"  ".repeat(depth));
    out.push_str(&node.name);
    out.push_str(&format!(" [{}]", node.kind.label()));
    if let Some(detail) = &node.detail {
        if !detail.is_empty() {
            out.push_str(&format!(" {detail}"));
        }
    }
    if node.deprecated {
        out.push_str(" (deprecated)");
    }
    out.push_str(&format!(
        " - {}:{}\n",
        node.selection_range.start.line + 1,
        node.selection_range.start.character + 1
    ));
    for child in &node.children {
        render_node(nodes, *child, depth + 1, out);
    }
}

/// Clamp a snippet to one line of bounded length for previews.
pub fn inline_snippet(text: &str, max: usize) -> String {
    let flattened = text.replace('\n', "\\n");
    if flattened.chars().count() <= max {
        return flattened;
    }
    let truncated: String = flattened.chars().take(max).collect();
    format!("{truncated}…")
}
