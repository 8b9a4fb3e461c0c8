//! Read-only navigation tools: hover, definitions, references, completion,
//! signature help, and code actions.

use lsp_types::{
    CompletionItem, Location, ParameterLabel, Position, Range, SignatureHelp,
};
use serde_json::{Value, json};

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::tools::args::{CodeActionsArgs, PositionArgs, SignatureHelpArgs, SymbolOnLineArgs};
use crate::tools::{render, resolve};

/// Completion lists are clipped; servers routinely return hundreds.
const MAX_COMPLETIONS: usize = 25;
const MAX_CODE_ACTIONS: usize = 25;

pub async fn hover(broker: &Broker, args: PositionArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            let position = resolve::position_for(
                &ctx.text,
                &args.line,
                args.character,
                args.target.as_deref(),
                &rel,
            )?;
            let result = ctx
                .request(
                    "textDocument/hover",
                    json!({ "textDocument": { "uri": ctx.uri }, "position": position }),
                )
                .await?;
            if result.is_null() {
                return Ok(format!(
                    "No hover information at {rel}:{}",
                    render::one_based(position)
                ));
            }
            let content = hover_content(&result);
            Ok(format!(
                "{rel}:{}\n\n{}",
                render::one_based(position),
                content.trim_end()
            ))
        })
        .await
}

fn hover_content(result: &Value) -> String {
    match result.get("contents") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Object(map)) => {
            // MarkupContent { kind, value } or MarkedString { language, value }
            match (map.get("value"), map.get("language")) {
                (Some(Value::String(value)), Some(Value::String(language))) => {
                    format!("```{language}\n{value}\n```")
                }
                (Some(Value::String(value)), None) => value.clone(),
                _ => String::new(),
            }
        }
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| hover_content(&json!({ "contents": item })))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

pub async fn definitions(broker: &Broker, args: SymbolOnLineArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            let line = resolve::resolve_line(&ctx.text, &args.line, &rel)?;
            let character =
                resolve::find_symbol_column(&ctx.text, line, &args.symbol_name, &rel)?;
            let result = ctx
                .request(
                    "textDocument/definition",
                    json!({
                        "textDocument": { "uri": ctx.uri },
                        "position": Position { line, character },
                    }),
                )
                .await?;
            let locations = normalize_locations(&result)?;
            if locations.is_empty() {
                return Ok(format!("No definitions found for '{}'", args.symbol_name));
            }

            let mut out = format!(
                "Found {} definition{} for '{}'\n",
                locations.len(),
                plural(locations.len()),
                args.symbol_name
            );
            for location in &locations {
                out.push_str(&format!("\n{}\n", render::location_line(&ctx.root, location)));
                if let Ok(target_text) = location
                    .uri
                    .to_file_path()
                    .map_err(|()| ())
                    .and_then(|p| std::fs::read_to_string(p).map_err(|_| ()))
                {
                    if let Some(line_text) =
                        render::line_text(&target_text, location.range.start.line)
                    {
                        out.push_str(&format!("  {}\n", line_text.trim_end()));
                    }
                }
            }
            Ok(out)
        })
        .await
}

pub async fn references(broker: &Broker, args: SymbolOnLineArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            let line = resolve::resolve_line(&ctx.text, &args.line, &rel)?;
            let character =
                resolve::find_symbol_column(&ctx.text, line, &args.symbol_name, &rel)?;
            let result = ctx
                .request(
                    "textDocument/references",
                    json!({
                        "textDocument": { "uri": ctx.uri },
                        "position": Position { line, character },
                        "context": { "includeDeclaration": true },
                    }),
                )
                .await?;
            let locations: Vec<Location> = match result {
                Value::Null => Vec::new(),
                other => serde_json::from_value(other).map_err(|e| {
                    BrokerError::Transport(format!("malformed references result: {e}"))
                })?,
            };
            if locations.is_empty() {
                return Ok(format!("No references found for '{}'", args.symbol_name));
            }

            let mut out = format!(
                "Found {} reference{} to '{}'\n",
                locations.len(),
                plural(locations.len()),
                args.symbol_name
            );
            for location in &locations {
                out.push_str(&format!("\n{}\n", render::location_line(&ctx.root, location)));
                // transient read races are skipped, not fatal
                let Ok(path) = location.uri.to_file_path() else {
                    continue;
                };
                let Ok(text) = std::fs::read_to_string(&path) else {
                    continue;
                };
                out.push_str(&render::context_block(&text, location.range.start.line));
            }
            Ok(out)
        })
        .await
}

pub async fn completion(broker: &Broker, args: PositionArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            let position = resolve::position_for(
                &ctx.text,
                &args.line,
                args.character,
                args.target.as_deref(),
                &rel,
            )?;
            let result = ctx
                .request(
                    "textDocument/completion",
                    json!({ "textDocument": { "uri": ctx.uri }, "position": position }),
                )
                .await?;

            let items: Vec<CompletionItem> = match &result {
                Value::Null => Vec::new(),
                Value::Array(_) => serde_json::from_value(result.clone()).map_err(|e| {
                    BrokerError::Transport(format!("malformed completion result: {e}"))
                })?,
                other => serde_json::from_value(
                    other.get("items").cloned().unwrap_or(Value::Null),
                )
                .map_err(|e| {
                    BrokerError::Transport(format!("malformed completion list: {e}"))
                })?,
            };
            if items.is_empty() {
                return Ok(format!(
                    "No completions at {rel}:{}",
                    render::one_based(position)
                ));
            }

            let total = items.len();
            let mut out = format!(
                "{total} completion{} at {rel}:{}\n\n",
                plural(total),
                render::one_based(position)
            );
            for item in items.iter().take(MAX_COMPLETIONS) {
                out.push_str(&item.label);
                if let Some(detail) = &item.detail {
                    if !detail.is_empty() {
                        out.push_str(&format!(" - {}", render::inline_snippet(detail, 60)));
                    }
                }
                out.push('\n');
            }
            if total > MAX_COMPLETIONS {
                out.push_str(&format!("… and {} more\n", total - MAX_COMPLETIONS));
            }
            Ok(out)
        })
        .await
}

pub async fn signature_help(broker: &Broker, args: SignatureHelpArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            let position = resolve::position_for(
                &ctx.text,
                &args.line,
                args.character,
                args.target.as_deref(),
                &rel,
            )?;
            let result = ctx
                .request(
                    "textDocument/signatureHelp",
                    json!({ "textDocument": { "uri": ctx.uri }, "position": position }),
                )
                .await?;
            if result.is_null() {
                return Ok(format!(
                    "No signature help at {rel}:{}",
                    render::one_based(position)
                ));
            }
            let help: SignatureHelp = serde_json::from_value(result).map_err(|e| {
                BrokerError::Transport(format!("malformed signatureHelp result: {e}"))
            })?;
            if help.signatures.is_empty() {
                return Ok(format!(
                    "No signature help at {rel}:{}",
                    render::one_based(position)
                ));
            }

            let active_signature = help.active_signature.unwrap_or(0) as usize;
            let mut out = String::new();
            for (index, signature) in help.signatures.iter().enumerate() {
                let marker = if index == active_signature { "→ " } else { "  " };
                out.push_str(&format!("{marker}{}\n", signature.label));
                if index == active_signature {
                    let active_parameter = signature
                        .active_parameter
                        .or(help.active_parameter)
                        .unwrap_or(0) as usize;
                    if let Some(parameters) = &signature.parameters {
                        for (pi, parameter) in parameters.iter().enumerate() {
                            let label = match &parameter.label {
                                ParameterLabel::Simple(text) => text.clone(),
                                ParameterLabel::LabelOffsets([start, end]) => signature
                                    .label
                                    .chars()
                                    .skip(*start as usize)
                                    .take((*end - *start) as usize)
                                    .collect(),
                            };
                            let arrow = if pi == active_parameter { "→" } else { " " };
                            out.push_str(&format!("    {arrow} {label}\n"));
                        }
                    }
                }
            }
            Ok(out)
        })
        .await
}

pub async fn code_actions(broker: &Broker, args: CodeActionsArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let range = range_from_arg(&ctx.text, &args.range)?;
            let diagnostics = args.diagnostics.clone().unwrap_or_default();
            let result = ctx
                .request(
                    "textDocument/codeAction",
                    json!({
                        "textDocument": { "uri": ctx.uri },
                        "range": range,
                        "context": { "diagnostics": diagnostics },
                    }),
                )
                .await?;
            let actions = match &result {
                Value::Null => &[] as &[Value],
                Value::Array(items) => items.as_slice(),
                _ => {
                    return Err(BrokerError::Transport(
                        "malformed codeAction result".into(),
                    ));
                }
            };
            if actions.is_empty() {
                return Ok("No code actions available".to_string());
            }

            let mut out = format!("{} code action{}\n\n", actions.len(), plural(actions.len()));
            for action in actions.iter().take(MAX_CODE_ACTIONS) {
                let title = action
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("(untitled)");
                match action.get("kind").and_then(Value::as_str) {
                    Some(kind) if !kind.is_empty() => {
                        out.push_str(&format!("- {title} [{kind}]\n"));
                    }
                    _ => out.push_str(&format!("- {title}\n")),
                }
            }
            Ok(out)
        })
        .await
}

/// Convert a one-based range argument, defaulting columns to the line
/// extremes.
pub fn range_from_arg(text: &str, arg: &crate::tools::args::RangeArg) -> Result<Range> {
    if arg.start_line == 0 || arg.end_line == 0 {
        return Err(BrokerError::InvalidArgument(
            "range lines are one-based".into(),
        ));
    }
    let start_line = arg.start_line - 1;
    let end_line = arg.end_line - 1;
    let end_line_text = render::line_text(text, end_line).unwrap_or_default();
    let start = Position {
        line: start_line,
        character: arg.start_character.map(|c| c.saturating_sub(1)).unwrap_or(0),
    };
    let end = Position {
        line: end_line,
        character: arg
            .end_character
            .map(|c| c.saturating_sub(1))
            .unwrap_or_else(|| resolve::utf16_len(end_line_text)),
    };
    if (end.line, end.character) < (start.line, start.character) {
        return Err(BrokerError::InvalidArgument(
            "range end precedes range start".into(),
        ));
    }
    Ok(Range { start, end })
}

/// Normalize Location | Location[] | LocationLink[] | null.
pub fn normalize_locations(result: &Value) -> Result<Vec<Location>> {
    let parse_one = |value: &Value| -> Result<Location> {
        if let Some(target_uri) = value.get("targetUri") {
            let range = value
                .get("targetSelectionRange")
                .or_else(|| value.get("targetRange"))
                .cloned()
                .unwrap_or(Value::Null);
            return serde_json::from_value(json!({ "uri": target_uri, "range": range }))
                .map_err(|e| BrokerError::Transport(format!("malformed location link: {e}")));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| BrokerError::Transport(format!("malformed location: {e}")))
    };

    match result {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(parse_one).collect(),
        single => Ok(vec![parse_one(single)?]),
    }
}

pub fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hover_contents_variants() {
        let markup = json!({ "contents": { "kind": "markdown", "value": "**greet**" } });
        assert_eq!(hover_content(&markup), "**greet**");

        let scalar = json!({ "contents": "plain text" });
        assert_eq!(hover_content(&scalar), "plain text");

        let language = json!({ "contents": { "language": "typescript", "value": "fn x()" } });
        assert_eq!(hover_content(&language), "```typescript\nfn x()\n```");

        let array = json!({ "contents": ["one", "two"] });
        assert_eq!(hover_content(&array), "one\n\ntwo");
    }

    #[test]
    fn location_normalization() {
        let null = normalize_locations(&Value::Null).unwrap();
        assert!(null.is_empty());

        let single = json!({
            "uri": "file:///p/a.ts",
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 5}}
        });
        assert_eq!(normalize_locations(&single).unwrap().len(), 1);

        let links = json!([{
            "originSelectionRange": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 5}},
            "targetUri": "file:///p/b.ts",
            "targetRange": {"start": {"line": 3, "character": 0}, "end": {"line": 5, "character": 1}},
            "targetSelectionRange": {"start": {"line": 3, "character": 9}, "end": {"line": 3, "character": 14}}
        }]);
        let parsed = normalize_locations(&links).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].range.start.line, 3);
        assert_eq!(parsed[0].range.start.character, 9);
    }

    #[test]
    fn range_arg_defaults_to_line_extremes() {
        let text = "short\na longer line here\n";
        let arg = crate::tools::args::RangeArg {
            start_line: 1,
            start_character: None,
            end_line: 2,
            end_character: None,
        };
        let range = range_from_arg(text, &arg).unwrap();
        assert_eq!(range.start, Position::new(0, 0));
        assert_eq!(range.end, Position::new(1, 18));
    }
}
