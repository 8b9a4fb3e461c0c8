//! Symbol tools: per-document trees, workspace search, and the index tools.

use std::path::Path;

use lsp_types::SymbolInformation;
use serde_json::{Value, json};
use walkdir::WalkDir;

use crate::broker::Broker;
use crate::config::{LanguageConfig, language_for_path};
use crate::error::{BrokerError, Result};
use crate::index::{SymbolKind, SymbolQuery, convert_symbol_response};
use crate::tools::args::{
    DocumentSymbolsArgs, IndexFilesArgs, IndexStatsArgs, SearchSymbolsArgs, WorkspaceSymbolsArgs,
};
use crate::tools::navigation::plural;
use crate::tools::render;

pub async fn get_document_symbols(broker: &Broker, args: DocumentSymbolsArgs) -> Result<String> {
    broker
        .with_document(&args.root, &args.file_path, |ctx| async move {
            let rel = ctx.rel_path();
            let response = ctx
                .request(
                    "textDocument/documentSymbol",
                    json!({ "textDocument": { "uri": ctx.uri } }),
                )
                .await?;
            let (nodes, roots) = convert_symbol_response(&response)?;
            if nodes.is_empty() {
                return Ok(format!("No symbols in {rel}"));
            }
            Ok(format!(
                "Symbols in {rel} ({})\n\n{}",
                nodes.len(),
                render::symbol_tree(&nodes, &roots)
            ))
        })
        .await
}

pub async fn get_workspace_symbols(broker: &Broker, args: WorkspaceSymbolsArgs) -> Result<String> {
    let Some(root) = &args.root else {
        // no root: answer from the cross-project index
        return Ok(render_index_hits(
            broker,
            &SymbolQuery {
                name: Some(args.query.clone()),
                ..Default::default()
            },
        ));
    };

    let language = detect_project_language(broker, root)?;
    let query = args.query.clone();
    let result = broker
        .with_project(root, language, |project| async move {
            let raw = project
                .entry
                .client
                .request(
                    "workspace/symbol",
                    json!({ "query": query }),
                    project.entry.language.profile.request_timeout,
                )
                .await?;
            let symbols: Vec<SymbolInformation> = match raw {
                Value::Null => Vec::new(),
                other => serde_json::from_value(other).map_err(|e| {
                    BrokerError::Transport(format!("malformed workspace/symbol result: {e}"))
                })?,
            };
            Ok(symbols)
        })
        .await;

    match result {
        Ok(symbols) => {
            if symbols.is_empty() {
                return Ok(format!("No workspace symbols matching {:?}", args.query));
            }
            let mut out = format!(
                "{} workspace symbol{} matching {:?}\n",
                symbols.len(),
                plural(symbols.len()),
                args.query
            );
            let mut current_file = String::new();
            for symbol in &symbols {
                let file = render::rel_display(root, &symbol.location.uri);
                if file != current_file {
                    out.push_str(&format!("\n{file}\n"));
                    current_file = file;
                }
                out.push_str(&format!(
                    "  {} [{}] - {}\n",
                    symbol.name,
                    SymbolKind::from_lsp(symbol.kind).label(),
                    render::one_based(symbol.location.range.start)
                ));
            }
            Ok(out)
        }
        // no workspace/symbol support: the index still answers
        Err(BrokerError::Unsupported(_)) => Ok(render_index_hits(
            broker,
            &SymbolQuery {
                name: Some(args.query.clone()),
                ..Default::default()
            },
        )),
        Err(e) => Err(e),
    }
}

pub fn search_symbols(broker: &Broker, args: SearchSymbolsArgs) -> Result<String> {
    let mut kinds = Vec::new();
    if let Some(kind_arg) = &args.kind {
        for name in kind_arg.names() {
            let kind = SymbolKind::parse(name).ok_or_else(|| {
                BrokerError::InvalidArgument(format!("unknown symbol kind {name:?}"))
            })?;
            kinds.push(kind);
        }
    }

    let file_filter = args.file.as_ref().map(|f| f.to_string_lossy().replace('\\', "/"));
    let query = SymbolQuery {
        name: args.name.clone(),
        kinds,
        container: args.container_name.clone(),
        file: None,
        include_children: args.include_children,
        include_external: args.include_external,
        only_external: args.only_external,
        source_library: args.source_library.clone(),
    };

    let mut hits = broker.index().query(&query);
    if let Some(filter) = &file_filter {
        hits.retain(|hit| hit.location.uri.path().ends_with(filter.as_str()));
    }

    if hits.is_empty() {
        let stats = broker.index().stats();
        if stats.files == 0 {
            return Ok("No matches (symbol index is empty; run index_files first)".into());
        }
        return Ok("No matching symbols".into());
    }

    let mut out = format!("{} symbol{}\n\n", hits.len(), plural(hits.len()));
    for hit in &hits {
        out.push_str(&format!("{} [{}]", hit.name, hit.kind.label()));
        if let Some(container) = &hit.container {
            out.push_str(&format!(" in {container}"));
        }
        if hit.deprecated {
            out.push_str(" (deprecated)");
        }
        if let Some(library) = &hit.library {
            out.push_str(&format!(" <{library}>"));
        }
        out.push_str(&format!(
            " - {}:{}\n",
            hit.location.uri.path(),
            render::one_based(hit.location.range.start)
        ));
    }
    Ok(out)
}

fn render_index_hits(broker: &Broker, query: &SymbolQuery) -> String {
    let hits = broker.index().query(query);
    if hits.is_empty() {
        return "No matching symbols".into();
    }
    let mut out = format!("{} symbol{} (from index)\n", hits.len(), plural(hits.len()));
    let mut current_file = String::new();
    for hit in &hits {
        let file = hit.location.uri.path().to_string();
        if file != current_file {
            out.push_str(&format!("\n{file}\n"));
            current_file = file;
        }
        out.push_str(&format!(
            "  {} [{}] - {}\n",
            hit.name,
            hit.kind.label(),
            render::one_based(hit.location.range.start)
        ));
    }
    out
}

pub async fn index_files(broker: &Broker, args: IndexFilesArgs) -> Result<String> {
    let report = broker
        .index()
        .index_project(&args.root, args.pattern.as_deref(), args.concurrency)
        .await?;
    let mut out = format!(
        "Indexed {} file{} in {:.1}s ({} from cache",
        report.indexed,
        plural(report.indexed),
        report.elapsed.as_secs_f64(),
        report.from_cache
    );
    if report.failed > 0 {
        out.push_str(&format!(", {} failed", report.failed));
    }
    out.push_str(")\n");
    if report.external_libraries > 0 {
        out.push_str(&format!(
            "External library files: {} ({} symbols)\n",
            report.external_libraries, report.external_symbols
        ));
    }
    let stats = broker.index().stats();
    out.push_str(&format!(
        "Index now holds {} file{}, {} symbol{}\n",
        stats.files,
        plural(stats.files),
        stats.symbols,
        plural(stats.symbols)
    ));
    Ok(out)
}

pub fn get_index_stats(broker: &Broker, _args: IndexStatsArgs) -> Result<String> {
    let stats = broker.index().stats();
    let mut out = format!(
        "Symbol index: {} file{} ({} external), {} symbol{}\n",
        stats.files,
        plural(stats.files),
        stats.external_files,
        stats.symbols,
        plural(stats.symbols)
    );
    if !stats.by_kind.is_empty() {
        out.push_str("\nBy kind:\n");
        for (kind, count) in &stats.by_kind {
            out.push_str(&format!("  {}: {}\n", kind.label(), count));
        }
    }
    if let Some(updated) = stats.last_updated {
        if let Ok(age) = updated.elapsed() {
            out.push_str(&format!("\nLast updated {}s ago\n", age.as_secs()));
        }
    }
    Ok(out)
}

/// Pick the language for a project-wide operation: explicit config override
/// first, then the first recognized source file under the root.
pub fn detect_project_language(
    broker: &Broker,
    root: &Path,
) -> Result<&'static LanguageConfig> {
    if let Ok(language) = broker.config().resolve_language(Path::new("_")) {
        // an explicit --language / force override resolves any path
        return Ok(language);
    }
    for entry in WalkDir::new(root)
        .max_depth(4)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && matches!(
                    e.file_name().to_str(),
                    Some(".git") | Some("node_modules") | Some("target") | Some(".lsmcp")
                ))
        })
        .flatten()
    {
        if entry.file_type().is_file() {
            if let Some(language) = language_for_path(entry.path()) {
                return Ok(language);
            }
        }
    }
    Err(BrokerError::InvalidArgument(format!(
        "could not detect a language under {}",
        root.display()
    )))
}
