//! Workspace-edit application.
//!
//! Edits arrive as LSP ranges (zero-based lines, UTF-16 character offsets).
//! Within one document they are applied end-to-start so earlier positions
//! stay valid. The applier returns per-file change summaries reconstructed
//! from the original contents, and can compute the inverse edit list for a
//! document (used to verify round trips and to report undo information).

use std::path::PathBuf;

use lsp_types::{
    DocumentChangeOperation, DocumentChanges, OneOf, Position, Range, TextEdit, Url,
    WorkspaceEdit,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BrokerError, Result};

/// One applied edit, positions zero-based in the pre-edit document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSummary {
    pub line: u32,
    pub character: u32,
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub changes: Vec<ChangeSummary>,
}

// File writes are serialized; concurrent tool calls must not interleave
// read-modify-write cycles.
static WRITE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Byte offset of an LSP position, counting characters in UTF-16 code units.
///
/// The position must lie inside the document: `line` within the line count
/// and `character` at most the line's UTF-16 length.
pub fn offset_at(text: &str, position: Position) -> Result<usize> {
    let mut offset = 0usize;
    for (index, line) in text.split('\n').enumerate() {
        if index < position.line as usize {
            offset += line.len() + 1;
            continue;
        }
        let mut units = 0u32;
        let mut bytes = 0usize;
        for ch in line.chars() {
            if units == position.character {
                break;
            }
            units += ch.len_utf16() as u32;
            bytes += ch.len_utf8();
            if units > position.character {
                return Err(BrokerError::EditConflict(format!(
                    "position {}:{} splits a surrogate pair",
                    position.line, position.character
                )));
            }
        }
        if units < position.character {
            return Err(BrokerError::EditConflict(format!(
                "character {} past end of line {}",
                position.character, position.line
            )));
        }
        return Ok(offset + bytes);
    }
    Err(BrokerError::EditConflict(format!(
        "line {} past end of document",
        position.line
    )))
}

/// Apply `edits` to `text`, returning the new text plus summaries in
/// document order. Overlapping edits are an [`BrokerError::EditConflict`].
pub fn apply_edits(text: &str, edits: &[TextEdit]) -> Result<(String, Vec<ChangeSummary>)> {
    let mut resolved: Vec<(usize, usize, &TextEdit)> = Vec::with_capacity(edits.len());
    for edit in edits {
        let start = offset_at(text, edit.range.start)?;
        let end = offset_at(text, edit.range.end)?;
        if start > end {
            return Err(BrokerError::EditConflict(format!(
                "range ends before it starts at {}:{}",
                edit.range.start.line, edit.range.start.character
            )));
        }
        resolved.push((start, end, edit));
    }
    resolved.sort_by_key(|(start, end, _)| (*start, *end));
    for pair in resolved.windows(2) {
        if pair[0].1 > pair[1].0 {
            return Err(BrokerError::EditConflict(
                "edits overlap within one document".into(),
            ));
        }
    }

    let mut output = text.to_string();
    let mut summaries = Vec::with_capacity(resolved.len());
    for (start, end, edit) in &resolved {
        summaries.push(ChangeSummary {
            line: edit.range.start.line,
            character: edit.range.start.character,
            old_text: text[*start..*end].to_string(),
            new_text: edit.new_text.clone(),
        });
    }
    for (start, end, edit) in resolved.iter().rev() {
        output.replace_range(*start..*end, &edit.new_text);
    }
    Ok((output, summaries))
}

/// Compute the edit list that undoes `edits` when applied to the post-edit
/// document. Applying an edit list and then its inverse restores the
/// original text byte for byte.
pub fn invert_edits(original: &str, edits: &[TextEdit]) -> Result<Vec<TextEdit>> {
    let mut sorted: Vec<&TextEdit> = edits.iter().collect();
    sorted.sort_by_key(|e| {
        (
            e.range.start.line,
            e.range.start.character,
            e.range.end.line,
            e.range.end.character,
        )
    });

    let mut inverses = Vec::with_capacity(sorted.len());
    let mut line_delta: i64 = 0;
    let mut char_delta: i64 = 0;
    // sentinel: no previous edit shares a line with anything
    let mut last_old_end = Position {
        line: u32::MAX,
        character: 0,
    };

    for edit in sorted {
        let start_off = offset_at(original, edit.range.start)?;
        let end_off = offset_at(original, edit.range.end)?;
        let old_text = &original[start_off..end_off];

        let new_start = Position {
            line: (edit.range.start.line as i64 + line_delta) as u32,
            character: if edit.range.start.line == last_old_end.line {
                (edit.range.start.character as i64 + char_delta) as u32
            } else {
                edit.range.start.character
            },
        };
        let new_end = advance(new_start, &edit.new_text);

        inverses.push(TextEdit {
            range: Range {
                start: new_start,
                end: new_end,
            },
            new_text: old_text.to_string(),
        });

        line_delta = new_end.line as i64 - edit.range.end.line as i64;
        char_delta = new_end.character as i64 - edit.range.end.character as i64;
        last_old_end = edit.range.end;
    }
    Ok(inverses)
}

/// Position reached by inserting `text` at `start`.
fn advance(start: Position, text: &str) -> Position {
    let newlines = text.bytes().filter(|&b| b == b'\n').count() as u32;
    if newlines == 0 {
        Position {
            line: start.line,
            character: start.character + utf16_len(text),
        }
    } else {
        let last_segment = text.rsplit('\n').next().unwrap_or_default();
        Position {
            line: start.line + newlines,
            character: utf16_len(last_segment),
        }
    }
}

fn utf16_len(text: &str) -> u32 {
    text.chars().map(|c| c.len_utf16() as u32).sum()
}

/// Flatten a workspace edit into per-URI text-edit lists. Resource
/// operations (file create/rename/delete) are not supported.
pub fn collect_text_edits(edit: &WorkspaceEdit) -> Result<Vec<(Url, Vec<TextEdit>)>> {
    if let Some(document_changes) = &edit.document_changes {
        let doc_edits = match document_changes {
            DocumentChanges::Edits(edits) => edits.clone(),
            DocumentChanges::Operations(operations) => {
                let mut edits = Vec::new();
                for operation in operations {
                    match operation {
                        DocumentChangeOperation::Edit(e) => edits.push(e.clone()),
                        DocumentChangeOperation::Op(_) => {
                            return Err(BrokerError::Unsupported(
                                "workspace edits with file create/rename/delete operations"
                                    .into(),
                            ));
                        }
                    }
                }
                edits
            }
        };
        return Ok(doc_edits
            .into_iter()
            .map(|doc| {
                let edits = doc
                    .edits
                    .into_iter()
                    .map(|e| match e {
                        OneOf::Left(edit) => edit,
                        OneOf::Right(annotated) => annotated.text_edit,
                    })
                    .collect();
                (doc.text_document.uri, edits)
            })
            .collect());
    }
    if let Some(changes) = &edit.changes {
        return Ok(changes
            .iter()
            .map(|(uri, edits)| (uri.clone(), edits.clone()))
            .collect());
    }
    Ok(Vec::new())
}

/// Apply a workspace edit directly to the filesystem, returning per-file
/// summaries. Used both for the local fallback when a server lacks
/// `workspace/applyEdit` delegation and for server-initiated edit requests.
pub fn apply_workspace_edit(edit: &WorkspaceEdit) -> Result<Vec<FileChange>> {
    let per_file = collect_text_edits(edit)?;
    let _write_guard = WRITE_LOCK.lock();

    let mut results = Vec::with_capacity(per_file.len());
    for (uri, edits) in per_file {
        if edits.is_empty() {
            continue;
        }
        let path = uri
            .to_file_path()
            .map_err(|()| BrokerError::InvalidArgument(format!("not a file URI: {uri}")))?;
        let original =
            std::fs::read_to_string(&path).map_err(|e| BrokerError::from_io(&path, e))?;
        let (updated, changes) = apply_edits(&original, &edits)?;
        std::fs::write(&path, &updated).map_err(|e| BrokerError::from_io(&path, e))?;
        debug!(file = %path.display(), edits = changes.len(), "applied workspace edit");
        results.push(FileChange { path, changes });
    }
    Ok(results)
}
