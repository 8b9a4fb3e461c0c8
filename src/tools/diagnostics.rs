//! Diagnostics tooling: per-file reports and the pattern-based batch mode.

use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::Glob;
use lsp_types::{Diagnostic, DiagnosticSeverity, NumberOrString};
use tracing::debug;
use walkdir::WalkDir;

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::lsp::capabilities::supports_pull_diagnostics;
use crate::lsp::diagnostics as diag;
use crate::tools::args::DiagnosticsArgs;

/// How long to wait for a fresh `publishDiagnostics` after opening before
/// falling back to pull / the latest snapshot.
const DIAG_WAIT: Duration = Duration::from_millis(1200);

struct FileReport {
    rel: String,
    outcome: Result<Vec<Diagnostic>>,
}

pub async fn get_diagnostics(broker: &Broker, args: DiagnosticsArgs) -> Result<String> {
    let files = resolve_file_set(&args.root, &args.file_paths, args.pattern.as_deref())?;
    let reports = collect(broker, &args.root, files).await?;
    Ok(render_reports(&reports).0)
}

/// Batch mode for the CLI: returns the report and whether any file had
/// errors (including file-level failures).
pub async fn check_project(
    broker: &Broker,
    root: &Path,
    pattern: &str,
) -> Result<(String, bool)> {
    let files = resolve_file_set(root, &[], Some(pattern))?;
    let reports = collect(broker, root, files).await?;
    let (text, has_errors) = render_reports(&reports);
    Ok((text, has_errors))
}

fn resolve_file_set(
    root: &Path,
    explicit: &[PathBuf],
    pattern: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = explicit.to_vec();
    if let Some(pattern) = pattern {
        let matcher = Glob::new(pattern)
            .map_err(|e| BrokerError::InvalidArgument(format!("bad glob {pattern:?}: {e}")))?
            .compile_matcher();
        for entry in WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
            !(e.file_type().is_dir()
                && matches!(
                    e.file_name().to_str(),
                    Some(".git") | Some("node_modules") | Some("target") | Some(".lsmcp")
                ))
        }) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if matcher.is_match(rel) {
                files.push(rel.to_path_buf());
            }
        }
        files.sort();
        files.dedup();
    }
    if files.is_empty() {
        return Err(BrokerError::InvalidArgument(
            "no files given: pass filePaths or a pattern".into(),
        ));
    }
    Ok(files)
}

async fn collect(broker: &Broker, root: &Path, files: Vec<PathBuf>) -> Result<Vec<FileReport>> {
    let language = {
        let probe = root.join(&files[0]);
        broker.config().resolve_language(&probe)?
    };

    broker
        .with_project(root, language, |project| async move {
            let mut reports = Vec::with_capacity(files.len());
            for file in files {
                let rel = file.to_string_lossy().replace('\\', "/");
                let outcome = project
                    .with_file(&file, |ctx| async move {
                        // closing clears snapshots, so one present now was
                        // published for the currently-open text
                        if ctx.entry.diagnostics.has_snapshot(&ctx.uri) {
                            return Ok(ctx.entry.diagnostics.get(&ctx.uri));
                        }
                        // otherwise wait briefly for the publish, then fall
                        // back to pull or the stored snapshot
                        match ctx.entry.diagnostics.wait_for(&ctx.uri, DIAG_WAIT).await {
                            Ok(diagnostics) => Ok(diagnostics),
                            Err(BrokerError::Timeout { .. }) => {
                                debug!(uri = %ctx.uri, "no publish within window; pulling");
                                diag::pull(
                                    &ctx.entry.client,
                                    &ctx.entry.diagnostics,
                                    supports_pull_diagnostics(&ctx.entry.capabilities),
                                    &ctx.uri,
                                    ctx.timeout(),
                                )
                                .await
                            }
                            Err(e) => Err(e),
                        }
                    })
                    .await;
                reports.push(FileReport { rel, outcome });
            }
            Ok(reports)
        })
        .await
}

fn render_reports(reports: &[FileReport]) -> (String, bool) {
    let mut out = String::new();
    let mut total_errors = 0usize;
    let mut total_warnings = 0usize;
    let mut failed_files = 0usize;

    for report in reports {
        match &report.outcome {
            Ok(diagnostics) => {
                let errors = diagnostics.iter().filter(|d| is_error(d)).count();
                let warnings = diagnostics
                    .iter()
                    .filter(|d| d.severity == Some(DiagnosticSeverity::WARNING))
                    .count();
                total_errors += errors;
                total_warnings += warnings;

                out.push_str(&format!(
                    "{}: {} error{}, {} warning{}\n",
                    report.rel,
                    errors,
                    plural(errors),
                    warnings,
                    plural(warnings)
                ));
                for diagnostic in diagnostics {
                    out.push_str(&format!(
                        "  {} {}:{}{} {}\n",
                        severity_label(diagnostic),
                        diagnostic.range.start.line + 1,
                        diagnostic.range.start.character + 1,
                        code_label(diagnostic),
                        diagnostic.message.lines().next().unwrap_or_default()
                    ));
                }
            }
            Err(e) => {
                failed_files += 1;
                out.push_str(&format!("{}: failed: {e}\n", report.rel));
            }
        }
    }

    out.push_str(&format!(
        "\n{} file{} checked: {} error{}, {} warning{}",
        reports.len(),
        plural(reports.len()),
        total_errors,
        plural(total_errors),
        total_warnings,
        plural(total_warnings)
    ));
    if failed_files > 0 {
        out.push_str(&format!(", {failed_files} failed"));
    }
    out.push('\n');

    (out, total_errors > 0 || failed_files > 0)
}

fn is_error(diagnostic: &Diagnostic) -> bool {
    // servers omitting severity mean "error" per the LSP default reading
    matches!(diagnostic.severity, Some(DiagnosticSeverity::ERROR) | None)
}

fn severity_label(diagnostic: &Diagnostic) -> &'static str {
    match diagnostic.severity {
        Some(DiagnosticSeverity::WARNING) => "warning",
        Some(DiagnosticSeverity::INFORMATION) => "info",
        Some(DiagnosticSeverity::HINT) => "hint",
        _ => "error",
    }
}

fn code_label(diagnostic: &Diagnostic) -> String {
    match &diagnostic.code {
        Some(NumberOrString::Number(n)) => format!(" [{n}]"),
        Some(NumberOrString::String(s)) => format!(" [{s}]"),
        None => String::new(),
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Position, Range};

    fn diagnostic(severity: Option<DiagnosticSeverity>, message: &str) -> Diagnostic {
        Diagnostic {
            range: Range {
                start: Position {
                    line: 0,
                    character: 6,
                },
                end: Position {
                    line: 0,
                    character: 7,
                },
            },
            severity,
            message: message.into(),
            ..Default::default()
        }
    }

    #[test]
    fn report_groups_by_file_with_counts() {
        let reports = vec![
            FileReport {
                rel: "src/a.ts".into(),
                outcome: Ok(vec![
                    diagnostic(Some(DiagnosticSeverity::ERROR), "type mismatch"),
                    diagnostic(Some(DiagnosticSeverity::WARNING), "unused"),
                ]),
            },
            FileReport {
                rel: "src/b.ts".into(),
                outcome: Ok(vec![]),
            },
        ];
        let (text, has_errors) = render_reports(&reports);
        assert!(has_errors);
        assert!(text.contains("src/a.ts: 1 error, 1 warning"));
        assert!(text.contains("error 1:7 type mismatch"));
        assert!(text.contains("src/b.ts: 0 errors, 0 warnings"));
        assert!(text.contains("2 files checked: 1 error, 1 warning"));
    }

    #[test]
    fn file_level_failures_flag_errors() {
        let reports = vec![FileReport {
            rel: "src/gone.ts".into(),
            outcome: Err(BrokerError::FileNotFound("src/gone.ts".into())),
        }];
        let (text, has_errors) = render_reports(&reports);
        assert!(has_errors);
        assert!(text.contains("failed"));
    }

    #[test]
    fn empty_file_set_is_invalid() {
        let err = resolve_file_set(Path::new("/tmp"), &[], None);
        assert!(matches!(err, Err(BrokerError::InvalidArgument(_))));
    }
}
