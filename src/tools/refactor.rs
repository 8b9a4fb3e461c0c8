//! Mutating tools: rename, symbol deletion, and formatting previews.

use std::collections::HashMap;

use lsp_types::{Position, Range, TextEdit, Url, WorkspaceEdit};
use serde_json::{Value, json};
use tracing::debug;

use crate::broker::Broker;
use crate::edits;
use crate::error::{BrokerError, Result};
use crate::index::convert_symbol_response;
use crate::lsp::capabilities::supports_rename;
use crate::tools::args::{DeleteSymbolArgs, FormatArgs, LineSelector, RenameArgs};
use crate::tools::navigation::{normalize_locations, plural, range_from_arg};
use crate::tools::{render, resolve};

pub async fn rename_symbol(broker: &Broker, args: RenameArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            if !supports_rename(&ctx.entry.capabilities) {
                return Err(unsupported_rename(ctx.entry.language.id));
            }

            let selector = args
                .line
                .clone()
                .unwrap_or_else(|| LineSelector::Substring(args.target.clone()));
            let line = resolve::resolve_line(&ctx.text, &selector, &rel)?;
            let character = resolve::find_symbol_column(&ctx.text, line, &args.target, &rel)?;

            let result = ctx
                .request(
                    "textDocument/rename",
                    json!({
                        "textDocument": { "uri": ctx.uri },
                        "position": Position { line, character },
                        "newName": args.new_name,
                    }),
                )
                .await
                .map_err(|e| match e {
                    BrokerError::Unsupported(_) => unsupported_rename(ctx.entry.language.id),
                    other => other,
                })?;

            if result.is_null() {
                return Ok(format!("No edits for renaming '{}'", args.target));
            }
            let workspace_edit: WorkspaceEdit = serde_json::from_value(result)
                .map_err(|e| BrokerError::Transport(format!("malformed rename edit: {e}")))?;
            let applied = edits::apply_workspace_edit(&workspace_edit)?;
            if applied.is_empty() {
                return Ok(format!("No edits for renaming '{}'", args.target));
            }

            let occurrences: usize = applied.iter().map(|f| f.changes.len()).sum();
            let mut out = format!(
                "Renamed '{}' → '{}' ({} occurrence{} in {} file{})\n",
                args.target,
                args.new_name,
                occurrences,
                plural(occurrences),
                applied.len(),
                plural(applied.len())
            );
            for file in &applied {
                let file_rel = file
                    .path
                    .strip_prefix(&ctx.root)
                    .unwrap_or(&file.path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push_str(&format!("\n{file_rel}\n"));
                for change in &file.changes {
                    out.push_str(&format!(
                        "  {}:{} \"{}\" → \"{}\"\n",
                        change.line + 1,
                        change.character + 1,
                        render::inline_snippet(&change.old_text, 40),
                        render::inline_snippet(&change.new_text, 40)
                    ));
                }
            }
            Ok(out)
        })
        .await
}

fn unsupported_rename(language: &str) -> BrokerError {
    BrokerError::Unsupported(format!(
        "The {language} language server doesn't support rename"
    ))
}

pub async fn delete_symbol(broker: &Broker, args: DeleteSymbolArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            let line = resolve::resolve_line(&ctx.text, &args.line, &rel)?;
            let character =
                resolve::find_symbol_column(&ctx.text, line, &args.symbol_name, &rel)?;

            // locate the full definition range through the symbol tree
            let response = ctx
                .request(
                    "textDocument/documentSymbol",
                    json!({ "textDocument": { "uri": ctx.uri } }),
                )
                .await?;
            let (nodes, _roots) = convert_symbol_response(&response)?;
            let definition = nodes
                .iter()
                .find(|node| {
                    node.name == args.symbol_name
                        && (node.selection_range.start.line == line
                            || crate::index::model::contains(
                                &node.range,
                                Position { line, character },
                            ))
                })
                .ok_or_else(|| BrokerError::SymbolNotFoundOnLine {
                    symbol: args.symbol_name.clone(),
                    line: line + 1,
                    file: rel.clone(),
                })?;

            // whole-line removal of the definition; when nothing follows it,
            // delete through end of file instead
            let line_count = ctx.text.split('\n').count() as u32;
            let end = if definition.range.end.line + 1 < line_count {
                Position {
                    line: definition.range.end.line + 1,
                    character: 0,
                }
            } else {
                let last = ctx.text.split('\n').next_back().unwrap_or_default();
                Position {
                    line: line_count.saturating_sub(1),
                    character: resolve::utf16_len(last),
                }
            };
            let definition_edit = TextEdit {
                range: Range {
                    start: Position {
                        line: definition.range.start.line,
                        character: 0,
                    },
                    end,
                },
                new_text: String::new(),
            };

            let mut per_file: HashMap<Url, Vec<TextEdit>> = HashMap::new();
            per_file
                .entry(ctx.uri.clone())
                .or_default()
                .push(definition_edit);

            if args.remove_references {
                let raw = ctx
                    .request(
                        "textDocument/references",
                        json!({
                            "textDocument": { "uri": ctx.uri },
                            "position": Position { line, character },
                            "context": { "includeDeclaration": false },
                        }),
                    )
                    .await?;
                for location in normalize_locations(&raw)? {
                    // occurrences inside the removed definition are already gone
                    if location.uri == ctx.uri
                        && location.range.start.line >= definition.range.start.line
                        && location.range.end.line <= definition.range.end.line
                    {
                        continue;
                    }
                    per_file.entry(location.uri).or_default().push(TextEdit {
                        range: location.range,
                        new_text: String::new(),
                    });
                }
            }

            let workspace_edit = WorkspaceEdit {
                changes: Some(per_file),
                ..Default::default()
            };
            let applied = edits::apply_workspace_edit(&workspace_edit)?;
            debug!(symbol = %args.symbol_name, files = applied.len(), "deleted symbol");

            let mut out = format!(
                "Deleted '{}' from {} file{}\n",
                args.symbol_name,
                applied.len(),
                plural(applied.len())
            );
            for file in &applied {
                let file_rel = file
                    .path
                    .strip_prefix(&ctx.root)
                    .unwrap_or(&file.path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push_str(&format!(
                    "  {} ({} edit{})\n",
                    file_rel,
                    file.changes.len(),
                    plural(file.changes.len())
                ));
            }
            Ok(out)
        })
        .await
}

pub async fn format_document(broker: &Broker, args: FormatArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            let options = args.options.clone().unwrap_or_default();
            let lsp_options = json!({
                "tabSize": options.tab_size,
                "insertSpaces": options.insert_spaces,
            });

            let result = match &args.range {
                Some(range_arg) => {
                    let range = range_from_arg(&ctx.text, range_arg)?;
                    ctx.request(
                        "textDocument/rangeFormatting",
                        json!({
                            "textDocument": { "uri": ctx.uri },
                            "range": range,
                            "options": lsp_options,
                        }),
                    )
                    .await?
                }
                None => {
                    ctx.request(
                        "textDocument/formatting",
                        json!({
                            "textDocument": { "uri": ctx.uri },
                            "options": lsp_options,
                        }),
                    )
                    .await?
                }
            };

            let text_edits: Vec<TextEdit> = match result {
                Value::Null => Vec::new(),
                other => serde_json::from_value(other).map_err(|e| {
                    BrokerError::Transport(format!("malformed formatting result: {e}"))
                })?,
            };
            if text_edits.is_empty() {
                return Ok(format!("{rel} is already formatted"));
            }

            // preview only: compute the summaries without touching the file
            let (_updated, changes) = edits::apply_edits(&ctx.text, &text_edits)?;
            let mut out = format!(
                "{} formatting change{} in {rel}\n\n",
                changes.len(),
                plural(changes.len())
            );
            for change in &changes {
                out.push_str(&format!(
                    "  {}:{} \"{}\" → \"{}\"\n",
                    change.line + 1,
                    change.character + 1,
                    render::inline_snippet(&change.old_text, 32),
                    render::inline_snippet(&change.new_text, 32)
                ));
            }
            Ok(out)
        })
        .await
}
