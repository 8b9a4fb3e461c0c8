//! Tool dispatch: the registry, argument validation, and error contexting.
//!
//! Each tool is a name plus a typed argument record; dispatch is a match over
//! the registry, not reflection. Handlers return human-oriented text; errors
//! keep their taxonomy kind and gain invocation context only when formatted
//! for the wire.

pub mod args;
pub mod diagnostics;
pub mod navigation;
pub mod refactor;
pub mod render;
pub mod resolve;
pub mod symbols;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::broker::Broker;
use crate::config::language_id_for_path;
use crate::error::{BrokerError, Result};

pub struct ToolSpec {
    pub name: &'static str,
    pub summary: &'static str,
}

pub static TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "get_hover",
        summary: "Signature and documentation for the symbol at a position",
    },
    ToolSpec {
        name: "find_references",
        summary: "Every reference to a symbol, with surrounding context lines",
    },
    ToolSpec {
        name: "get_definitions",
        summary: "Definition locations for a symbol",
    },
    ToolSpec {
        name: "get_diagnostics",
        summary: "Diagnostics for the given files, grouped with counts",
    },
    ToolSpec {
        name: "rename_symbol",
        summary: "Rename a symbol across the project",
    },
    ToolSpec {
        name: "delete_symbol",
        summary: "Delete a symbol definition, optionally with its references",
    },
    ToolSpec {
        name: "get_document_symbols",
        summary: "Symbol tree of one file with kind tags",
    },
    ToolSpec {
        name: "get_workspace_symbols",
        summary: "Workspace-wide symbol search, grouped by file",
    },
    ToolSpec {
        name: "get_completion",
        summary: "Completion candidates at a position",
    },
    ToolSpec {
        name: "get_signature_help",
        summary: "Call signatures with the active parameter marked",
    },
    ToolSpec {
        name: "get_code_actions",
        summary: "Available code actions for a range",
    },
    ToolSpec {
        name: "format_document",
        summary: "Preview of formatting changes for a whole file",
    },
    ToolSpec {
        name: "format_range",
        summary: "Preview of formatting changes for a range",
    },
    ToolSpec {
        name: "search_symbols",
        summary: "Query the persistent symbol index",
    },
    ToolSpec {
        name: "index_files",
        summary: "Index project files into the symbol index",
    },
    ToolSpec {
        name: "get_index_stats",
        summary: "Symbol index totals and freshness",
    },
];

pub fn is_known_tool(name: &str) -> bool {
    TOOLS.iter().any(|tool| tool.name == name)
}

fn parse<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| BrokerError::InvalidArgument(format!("{tool}: {e}")))
}

/// Validate arguments and run the named tool.
pub async fn dispatch(broker: &Broker, tool: &str, arguments: Value) -> Result<String> {
    match tool {
        "get_hover" => navigation::hover(broker, parse(tool, arguments)?).await,
        "find_references" => navigation::references(broker, parse(tool, arguments)?).await,
        "get_definitions" => navigation::definitions(broker, parse(tool, arguments)?).await,
        "get_diagnostics" => diagnostics::get_diagnostics(broker, parse(tool, arguments)?).await,
        "rename_symbol" => refactor::rename_symbol(broker, parse(tool, arguments)?).await,
        "delete_symbol" => refactor::delete_symbol(broker, parse(tool, arguments)?).await,
        "get_document_symbols" => {
            symbols::get_document_symbols(broker, parse(tool, arguments)?).await
        }
        "get_workspace_symbols" => {
            symbols::get_workspace_symbols(broker, parse(tool, arguments)?).await
        }
        "get_completion" => navigation::completion(broker, parse(tool, arguments)?).await,
        "get_signature_help" => {
            navigation::signature_help(broker, parse(tool, arguments)?).await
        }
        "get_code_actions" => navigation::code_actions(broker, parse(tool, arguments)?).await,
        "format_document" => refactor::format_document(broker, parse(tool, arguments)?).await,
        "format_range" => {
            let parsed: args::FormatArgs = parse(tool, arguments)?;
            if parsed.range.is_none() {
                return Err(BrokerError::InvalidArgument(
                    "format_range requires a range".into(),
                ));
            }
            refactor::format_document(broker, parsed).await
        }
        "search_symbols" => symbols::search_symbols(broker, parse(tool, arguments)?),
        "index_files" => symbols::index_files(broker, parse(tool, arguments)?).await,
        "get_index_stats" => symbols::get_index_stats(broker, parse(tool, arguments)?),
        other => Err(BrokerError::InvalidArgument(format!(
            "unknown tool {other:?}"
        ))),
    }
}

/// Wire-facing error message: the taxonomy text plus whatever invocation
/// context the arguments carried.
pub fn describe_error(tool: &str, arguments: &Value, error: &BrokerError) -> String {
    let mut context = Vec::new();
    if let Some(file) = arguments.get("filePath").and_then(Value::as_str) {
        context.push(format!("file: {file}"));
        let language = language_id_for_path(std::path::Path::new(file));
        if language != "plaintext" {
            context.push(format!("language: {language}"));
        }
    }
    for key in ["symbolName", "target", "query", "name"] {
        if let Some(symbol) = arguments.get(key).and_then(Value::as_str) {
            context.push(format!("symbol: {symbol}"));
            break;
        }
    }
    if context.is_empty() {
        format!("{tool} failed: {error}")
    } else {
        format!("{tool} failed ({}): {error}", context.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_matches_dispatch_arms() {
        for tool in TOOLS {
            assert!(is_known_tool(tool.name));
        }
        assert!(!is_known_tool("move_file"));
    }

    #[test]
    fn error_description_carries_context() {
        let arguments = serde_json::json!({
            "root": "/p",
            "filePath": "src/a.ts",
            "symbolName": "greet",
            "line": 1
        });
        let error = BrokerError::Unsupported("server does not support rename".into());
        let text = describe_error("rename_symbol", &arguments, &error);
        assert!(text.contains("rename_symbol failed"));
        assert!(text.contains("file: src/a.ts"));
        assert!(text.contains("language: typescript"));
        assert!(text.contains("symbol: greet"));
        assert!(text.contains("does not support rename"));
    }
}
