//! Per-tool argument records.
//!
//! Tool arguments arrive as JSON objects with camelCase keys; unknown fields
//! are rejected so schema drift surfaces as an `InvalidArgument` instead of
//! silent misbehavior. Lines and columns are one-based at this boundary.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

/// A `line` argument: a one-based line number, or a substring selecting the
/// first line that contains it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LineSelector {
    Number(u32),
    Substring(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PositionArgs {
    pub root: PathBuf,
    pub file_path: PathBuf,
    pub line: LineSelector,
    #[serde(default)]
    pub character: Option<u32>,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SymbolOnLineArgs {
    pub root: PathBuf,
    pub file_path: PathBuf,
    pub line: LineSelector,
    pub symbol_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiagnosticsArgs {
    pub root: PathBuf,
    #[serde(default)]
    pub file_paths: Vec<PathBuf>,
    /// Glob, relative to root; alternative to explicit paths.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenameArgs {
    pub root: PathBuf,
    pub file_path: PathBuf,
    #[serde(default)]
    pub line: Option<LineSelector>,
    pub target: String,
    pub new_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeleteSymbolArgs {
    pub root: PathBuf,
    pub file_path: PathBuf,
    pub line: LineSelector,
    pub symbol_name: String,
    #[serde(default)]
    pub remove_references: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DocumentSymbolsArgs {
    pub root: PathBuf,
    pub file_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkspaceSymbolsArgs {
    pub query: String,
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SignatureHelpArgs {
    pub root: PathBuf,
    pub file_path: PathBuf,
    pub line: LineSelector,
    #[serde(default)]
    pub character: Option<u32>,
    #[serde(default)]
    pub target: Option<String>,
}

/// One-based line/column range; columns default to the line extremes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RangeArg {
    pub start_line: u32,
    #[serde(default)]
    pub start_character: Option<u32>,
    pub end_line: u32,
    #[serde(default)]
    pub end_character: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CodeActionsArgs {
    pub root: PathBuf,
    pub file_path: PathBuf,
    pub range: RangeArg,
    /// Raw LSP diagnostics to pass through as the code-action context.
    #[serde(default)]
    pub diagnostics: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FormatOptionsArg {
    #[serde(default = "default_tab_size")]
    pub tab_size: u32,
    #[serde(default = "default_insert_spaces")]
    pub insert_spaces: bool,
}

impl Default for FormatOptionsArg {
    fn default() -> Self {
        Self {
            tab_size: default_tab_size(),
            insert_spaces: default_insert_spaces(),
        }
    }
}

fn default_tab_size() -> u32 {
    2
}

fn default_insert_spaces() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FormatArgs {
    pub root: PathBuf,
    pub file_path: PathBuf,
    #[serde(default)]
    pub options: Option<FormatOptionsArg>,
    #[serde(default)]
    pub range: Option<RangeArg>,
}

/// `kind` accepts a single name or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KindArg {
    One(String),
    Many(Vec<String>),
}

impl KindArg {
    pub fn names(&self) -> Vec<&str> {
        match self {
            KindArg::One(name) => vec![name.as_str()],
            KindArg::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SearchSymbolsArgs {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<KindArg>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub include_children: bool,
    #[serde(default)]
    pub include_external: bool,
    #[serde(default)]
    pub only_external: bool,
    #[serde(default)]
    pub source_library: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexFilesArgs {
    pub root: PathBuf,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IndexStatsArgs {
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_selector_accepts_number_and_substring() {
        let number: LineSelector = serde_json::from_value(json!(12)).unwrap();
        assert!(matches!(number, LineSelector::Number(12)));
        let substring: LineSelector = serde_json::from_value(json!("function greet")).unwrap();
        assert!(matches!(substring, LineSelector::Substring(s) if s == "function greet"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_value::<DocumentSymbolsArgs>(json!({
            "root": "/p",
            "filePath": "a.ts",
            "bogus": true
        }));
        assert!(err.is_err());
    }

    #[test]
    fn search_defaults() {
        let args: SearchSymbolsArgs = serde_json::from_value(json!({})).unwrap();
        assert!(args.include_children);
        assert!(!args.include_external);
        assert!(!args.only_external);
    }

    #[test]
    fn kind_arg_single_or_list() {
        let one: KindArg = serde_json::from_value(json!("Class")).unwrap();
        assert_eq!(one.names(), vec!["Class"]);
        let many: KindArg = serde_json::from_value(json!(["Class", "Function"])).unwrap();
        assert_eq!(many.names(), vec!["Class", "Function"]);
    }
}
