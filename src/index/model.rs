//! Symbol entry model.
//!
//! Document symbols are stored as an arena of nodes with integer ids; parent
//! and child links are ids, never pointers, so records serialize cleanly into
//! the persistent cache and the tree stays acyclic by construction.

use std::path::Path;
use std::time::SystemTime;

use lsp_types::{DocumentSymbol, Location, Position, Range, SymbolInformation, Url};
use serde::{Deserialize, Serialize};

pub type SymbolNodeId = u32;

/// Symbol kinds, mirroring LSP's set. Kept as a crate-local enum so cache
/// records stay stable across `lsp-types` upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    File,
    Module,
    Namespace,
    Package,
    Class,
    Method,
    Property,
    Field,
    Constructor,
    Enum,
    Interface,
    Function,
    Variable,
    Constant,
    String,
    Number,
    Boolean,
    Array,
    Object,
    Key,
    Null,
    EnumMember,
    Struct,
    Event,
    Operator,
    TypeParameter,
}

impl SymbolKind {
    pub fn from_lsp(kind: lsp_types::SymbolKind) -> Self {
        use lsp_types::SymbolKind as K;
        match kind {
            K::FILE => SymbolKind::File,
            K::MODULE => SymbolKind::Module,
            K::NAMESPACE => SymbolKind::Namespace,
            K::PACKAGE => SymbolKind::Package,
            K::CLASS => SymbolKind::Class,
            K::METHOD => SymbolKind::Method,
            K::PROPERTY => SymbolKind::Property,
            K::FIELD => SymbolKind::Field,
            K::CONSTRUCTOR => SymbolKind::Constructor,
            K::ENUM => SymbolKind::Enum,
            K::INTERFACE => SymbolKind::Interface,
            K::FUNCTION => SymbolKind::Function,
            K::VARIABLE => SymbolKind::Variable,
            K::CONSTANT => SymbolKind::Constant,
            K::STRING => SymbolKind::String,
            K::NUMBER => SymbolKind::Number,
            K::BOOLEAN => SymbolKind::Boolean,
            K::ARRAY => SymbolKind::Array,
            K::OBJECT => SymbolKind::Object,
            K::KEY => SymbolKind::Key,
            K::NULL => SymbolKind::Null,
            K::ENUM_MEMBER => SymbolKind::EnumMember,
            K::STRUCT => SymbolKind::Struct,
            K::EVENT => SymbolKind::Event,
            K::OPERATOR => SymbolKind::Operator,
            _ => SymbolKind::TypeParameter,
        }
    }

    /// Parse a kind name as it appears in tool arguments (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        let kind = match lowered.as_str() {
            "file" => SymbolKind::File,
            "module" => SymbolKind::Module,
            "namespace" => SymbolKind::Namespace,
            "package" => SymbolKind::Package,
            "class" => SymbolKind::Class,
            "method" => SymbolKind::Method,
            "property" => SymbolKind::Property,
            "field" => SymbolKind::Field,
            "constructor" => SymbolKind::Constructor,
            "enum" => SymbolKind::Enum,
            "interface" => SymbolKind::Interface,
            "function" => SymbolKind::Function,
            "variable" => SymbolKind::Variable,
            "constant" => SymbolKind::Constant,
            "string" => SymbolKind::String,
            "number" => SymbolKind::Number,
            "boolean" => SymbolKind::Boolean,
            "array" => SymbolKind::Array,
            "object" => SymbolKind::Object,
            "key" => SymbolKind::Key,
            "null" => SymbolKind::Null,
            "enummember" | "enum_member" => SymbolKind::EnumMember,
            "struct" => SymbolKind::Struct,
            "event" => SymbolKind::Event,
            "operator" => SymbolKind::Operator,
            "typeparameter" | "type_parameter" => SymbolKind::TypeParameter,
            _ => return None,
        };
        Some(kind)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SymbolKind::File => "File",
            SymbolKind::Module => "Module",
            SymbolKind::Namespace => "Namespace",
            SymbolKind::Package => "Package",
            SymbolKind::Class => "Class",
            SymbolKind::Method => "Method",
            SymbolKind::Property => "Property",
            SymbolKind::Field => "Field",
            SymbolKind::Constructor => "Constructor",
            SymbolKind::Enum => "Enum",
            SymbolKind::Interface => "Interface",
            SymbolKind::Function => "Function",
            SymbolKind::Variable => "Variable",
            SymbolKind::Constant => "Constant",
            SymbolKind::String => "String",
            SymbolKind::Number => "Number",
            SymbolKind::Boolean => "Boolean",
            SymbolKind::Array => "Array",
            SymbolKind::Object => "Object",
            SymbolKind::Key => "Key",
            SymbolKind::Null => "Null",
            SymbolKind::EnumMember => "EnumMember",
            SymbolKind::Struct => "Struct",
            SymbolKind::Event => "Event",
            SymbolKind::Operator => "Operator",
            SymbolKind::TypeParameter => "TypeParameter",
        }
    }
}

/// One symbol in a file's arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolNode {
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
    pub selection_range: Range,
    /// Name of the enclosing symbol, if any.
    pub container: Option<String>,
    pub detail: Option<String>,
    pub deprecated: bool,
    pub parent: Option<SymbolNodeId>,
    pub children: Vec<SymbolNodeId>,
}

/// All symbols of one file plus the cache-relevant metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSymbols {
    pub uri: Url,
    pub modified_at: SystemTime,
    /// blake3 of the file bytes, lowercase hex.
    pub content_hash: String,
    pub nodes: Vec<SymbolNode>,
    pub roots: Vec<SymbolNodeId>,
    pub external: bool,
    /// Package name when the file lives under a dependency directory.
    pub library: Option<String>,
}

impl FileSymbols {
    pub fn node(&self, id: SymbolNodeId) -> &SymbolNode {
        &self.nodes[id as usize]
    }

    pub fn symbol_count(&self) -> usize {
        self.nodes.len()
    }

    /// Deepest node whose range contains `position`, walking the tree from
    /// the roots.
    pub fn symbol_at(&self, position: Position) -> Option<SymbolNodeId> {
        let mut best: Option<SymbolNodeId> = None;
        let mut cursor: Vec<SymbolNodeId> = self.roots.clone();
        while let Some(id) = cursor.iter().copied().find(|id| {
            let node = self.node(*id);
            contains(&node.range, position)
        }) {
            best = Some(id);
            cursor = self.node(id).children.clone();
        }
        best
    }
}

pub fn contains(range: &Range, position: Position) -> bool {
    (position.line > range.start.line
        || (position.line == range.start.line && position.character >= range.start.character))
        && (position.line < range.end.line
            || (position.line == range.end.line && position.character <= range.end.character))
}

/// Identify dependency-directory files: `…/node_modules/<pkg>/…` (scoped
/// packages keep their scope).
pub fn external_library(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut components = rel.components().map(|c| c.as_os_str().to_string_lossy());
    while let Some(component) = components.next() {
        if component == "node_modules" {
            let first = components.next()?;
            if let Some(stripped) = first.strip_prefix('@') {
                let second = components.next()?;
                return Some(format!("@{stripped}/{second}"));
            }
            return Some(first.into_owned());
        }
    }
    None
}

/// Build an arena from a `textDocument/documentSymbol` response, either
/// hierarchical or flat.
pub struct ArenaBuilder {
    nodes: Vec<SymbolNode>,
    roots: Vec<SymbolNodeId>,
}

impl ArenaBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn from_nested(symbols: &[DocumentSymbol]) -> (Vec<SymbolNode>, Vec<SymbolNodeId>) {
        let mut builder = Self::new();
        for symbol in symbols {
            let id = builder.push_nested(symbol, None);
            builder.roots.push(id);
        }
        (builder.nodes, builder.roots)
    }

    pub fn from_flat(symbols: &[SymbolInformation]) -> (Vec<SymbolNode>, Vec<SymbolNodeId>) {
        let mut builder = Self::new();
        for symbol in symbols {
            let id = builder.nodes.len() as SymbolNodeId;
            #[allow(deprecated)]
            builder.nodes.push(SymbolNode {
                name: symbol.name.clone(),
                kind: SymbolKind::from_lsp(symbol.kind),
                range: symbol.location.range,
                selection_range: symbol.location.range,
                container: symbol.container_name.clone(),
                detail: None,
                deprecated: symbol.deprecated.unwrap_or(false),
                parent: None,
                children: Vec::new(),
            });
            builder.roots.push(id);
        }
        (builder.nodes, builder.roots)
    }

    fn push_nested(&mut self, symbol: &DocumentSymbol, parent: Option<SymbolNodeId>) -> SymbolNodeId {
        let id = self.nodes.len() as SymbolNodeId;
        let container = parent.map(|p| self.nodes[p as usize].name.clone());
        #[allow(deprecated)]
        self.nodes.push(SymbolNode {
            name: symbol.name.clone(),
            kind: SymbolKind::from_lsp(symbol.kind),
            range: symbol.range,
            selection_range: symbol.selection_range,
            container,
            detail: symbol.detail.clone(),
            deprecated: symbol.deprecated.unwrap_or(false),
            parent,
            children: Vec::new(),
        });
        if let Some(children) = &symbol.children {
            for child in children {
                let child_id = self.push_nested(child, Some(id));
                self.nodes[id as usize].children.push(child_id);
            }
        }
        id
    }
}

impl Default for ArenaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A query hit, flattened for rendering.
#[derive(Debug, Clone)]
pub struct SymbolHit {
    pub name: String,
    pub kind: SymbolKind,
    pub location: Location,
    pub container: Option<String>,
    pub detail: Option<String>,
    pub deprecated: bool,
    pub external: bool,
    pub library: Option<String>,
    pub is_root: bool,
}
