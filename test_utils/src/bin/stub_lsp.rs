//! Scripted language server for integration tests.
//!
//! Speaks framed JSON-RPC over stdio and implements just enough of LSP 3.17
//! to exercise every broker path: handshake, full-text document sync with
//! push diagnostics, hover, definition, references, document symbols,
//! completion, signature help, code actions, formatting, and rename.
//!
//! Behavior toggles:
//!   --no-rename         advertise no rename support
//!   --rename-unhandled  advertise rename but answer it with -32601
//!   --diag-delay-ms N   sleep before publishing diagnostics

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use lsmcp::lsp::framing::{FrameDecoder, encode_message};

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "rs", "py", "go"];

struct Stub {
    root: Option<PathBuf>,
    open: HashMap<String, String>,
    no_rename: bool,
    rename_unhandled: bool,
    diag_delay_ms: u64,
    stdout: std::io::Stdout,
}

fn main() {
    let mut no_rename = false;
    let mut rename_unhandled = false;
    let mut diag_delay_ms = 0u64;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--no-rename" => no_rename = true,
            "--rename-unhandled" => rename_unhandled = true,
            "--diag-delay-ms" => {
                diag_delay_ms = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default();
            }
            _ => {}
        }
    }

    let mut stub = Stub {
        root: None,
        open: HashMap::new(),
        no_rename,
        rename_unhandled,
        diag_delay_ms,
        stdout: std::io::stdout(),
    };

    let mut stdin = std::io::stdin();
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match stdin.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.push(&chunk[..n]);
        while let Ok(Some(body)) = decoder.next_frame() {
            let Ok(message) = serde_json::from_slice::<Value>(&body) else {
                continue;
            };
            stub.handle(message);
        }
    }
}

impl Stub {
    fn send(&mut self, message: Value) {
        let bytes = encode_message(&message);
        let _ = self.stdout.write_all(&bytes);
        let _ = self.stdout.flush();
    }

    fn respond(&mut self, id: Value, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }

    fn respond_error(&mut self, id: Value, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }));
    }

    fn handle(&mut self, message: Value) {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let id = message.get("id").cloned();

        match (id, method.as_str()) {
            (Some(id), "initialize") => {
                self.root = params
                    .get("rootUri")
                    .and_then(Value::as_str)
                    .and_then(uri_to_path);
                let rename_capability = json!(!self.no_rename);
                self.respond(
                    id,
                    json!({
                        "capabilities": {
                            "textDocumentSync": 1,
                            "hoverProvider": true,
                            "definitionProvider": true,
                            "referencesProvider": true,
                            "documentSymbolProvider": true,
                            "completionProvider": { "triggerCharacters": ["."] },
                            "signatureHelpProvider": { "triggerCharacters": ["(", ","] },
                            "codeActionProvider": true,
                            "documentFormattingProvider": true,
                            "documentRangeFormattingProvider": true,
                            "renameProvider": rename_capability,
                            "workspaceSymbolProvider": true
                        },
                        "serverInfo": { "name": "stub-lsp", "version": "0.1.0" }
                    }),
                );
            }
            (Some(id), "shutdown") => self.respond(id, Value::Null),
            (None, "exit") => std::process::exit(0),
            (None, "initialized") | (None, "$/cancelRequest") => {}

            (None, "textDocument/didOpen") => {
                let uri = text_document_uri(&params);
                let text = params["textDocument"]["text"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                self.open.insert(uri.clone(), text);
                self.publish_diagnostics(&uri);
            }
            (None, "textDocument/didChange") => {
                let uri = text_document_uri(&params);
                if let Some(text) = params["contentChanges"]
                    .as_array()
                    .and_then(|changes| changes.last())
                    .and_then(|change| change["text"].as_str())
                {
                    self.open.insert(uri.clone(), text.to_string());
                }
                self.publish_diagnostics(&uri);
            }
            (None, "textDocument/didClose") => {
                let uri = text_document_uri(&params);
                self.open.remove(&uri);
            }

            (Some(id), "textDocument/hover") => {
                let reply = self.hover(&params);
                self.respond(id, reply);
            }
            (Some(id), "textDocument/definition") => {
                let reply = self.definition(&params);
                self.respond(id, reply);
            }
            (Some(id), "textDocument/references") => {
                let reply = self.references(&params);
                self.respond(id, reply);
            }
            (Some(id), "textDocument/documentSymbol") => {
                let reply = self.document_symbols(&params);
                self.respond(id, reply);
            }
            (Some(id), "textDocument/completion") => {
                let reply = self.completion(&params);
                self.respond(id, reply);
            }
            (Some(id), "textDocument/signatureHelp") => {
                let reply = self.signature_help(&params);
                self.respond(id, reply);
            }
            (Some(id), "textDocument/codeAction") => self.respond(id, json!([])),
            (Some(id), "textDocument/formatting") => {
                let reply = self.formatting(&params, None);
                self.respond(id, reply);
            }
            (Some(id), "textDocument/rangeFormatting") => {
                let range = params.get("range").cloned();
                let reply = self.formatting(&params, range);
                self.respond(id, reply);
            }
            (Some(id), "textDocument/rename") => {
                if self.no_rename || self.rename_unhandled {
                    self.respond_error(id, -32601, "Unhandled method textDocument/rename");
                } else {
                    let reply = self.rename(&params);
                    self.respond(id, reply);
                }
            }
            (Some(id), "workspace/symbol") => {
                let reply = self.workspace_symbols(&params);
                self.respond(id, reply);
            }
            (Some(id), _) => self.respond_error(id, -32601, &format!("Unhandled method {method}")),
            (None, _) => {}
        }
    }

    fn text(&self, uri: &str) -> Option<String> {
        if let Some(open) = self.open.get(uri) {
            return Some(open.clone());
        }
        uri_to_path(uri).and_then(|path| std::fs::read_to_string(path).ok())
    }

    /// All source files under the root, preferring open-document contents.
    fn workspace_texts(&self) -> Vec<(String, String)> {
        let mut texts: Vec<(String, String)> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        if let Some(root) = &self.root {
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if path.is_dir() {
                        if name != ".git" && name != "node_modules" && name != ".lsmcp" {
                            stack.push(path);
                        }
                        continue;
                    }
                    let is_source = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| SOURCE_EXTENSIONS.contains(&e))
                        .unwrap_or(false);
                    if !is_source {
                        continue;
                    }
                    let uri = path_to_uri(&path);
                    let text = self
                        .open
                        .get(&uri)
                        .cloned()
                        .or_else(|| std::fs::read_to_string(&path).ok());
                    if let Some(text) = text {
                        seen.push(uri.clone());
                        texts.push((uri, text));
                    }
                }
            }
        }
        for (uri, text) in &self.open {
            if !seen.contains(uri) {
                texts.push((uri.clone(), text.clone()));
            }
        }
        texts.sort_by(|a, b| a.0.cmp(&b.0));
        texts
    }

    fn publish_diagnostics(&mut self, uri: &str) {
        if self.diag_delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.diag_delay_ms));
        }
        let text = self.text(uri).unwrap_or_default();
        let mut diagnostics = Vec::new();
        for (line_index, line) in text.lines().enumerate() {
            if let Some(range) = string_type_mismatch(line, line_index as u32) {
                diagnostics.push(json!({
                    "range": range,
                    "severity": 1,
                    "code": "2322",
                    "source": "stub-lsp",
                    "message": "Type 'number' is not assignable to type 'string'."
                }));
            }
            if let Some(column) = line.find("TYPE_ERROR") {
                diagnostics.push(json!({
                    "range": {
                        "start": { "line": line_index, "character": column },
                        "end": { "line": line_index, "character": column + "TYPE_ERROR".len() }
                    },
                    "severity": 1,
                    "source": "stub-lsp",
                    "message": "marker diagnostic"
                }));
            }
        }
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": { "uri": uri, "diagnostics": diagnostics },
        }));
    }

    fn hover(&self, params: &Value) -> Value {
        let uri = text_document_uri(params);
        let Some(text) = self.text(&uri) else {
            return Value::Null;
        };
        let (line, character) = position_of(params);
        let Some(word) = word_at(&text, line, character) else {
            return Value::Null;
        };
        let line_text = text.lines().nth(line as usize).unwrap_or_default().trim();
        json!({
            "contents": {
                "kind": "markdown",
                "value": format!("```typescript\n{line_text}\n```\n\nSymbol `{word}`")
            }
        })
    }

    fn definition(&self, params: &Value) -> Value {
        let uri = text_document_uri(params);
        let Some(text) = self.text(&uri) else {
            return Value::Null;
        };
        let (line, character) = position_of(params);
        let Some(word) = word_at(&text, line, character) else {
            return Value::Null;
        };
        for (file_uri, file_text) in self.workspace_texts() {
            for (line_index, line_text) in file_text.lines().enumerate() {
                if let Some(column) = definition_column(line_text, &word) {
                    return json!([{
                        "uri": file_uri,
                        "range": {
                            "start": { "line": line_index, "character": column },
                            "end": { "line": line_index, "character": column + word.len() }
                        }
                    }]);
                }
            }
        }
        Value::Null
    }

    fn references(&self, params: &Value) -> Value {
        let uri = text_document_uri(params);
        let Some(text) = self.text(&uri) else {
            return json!([]);
        };
        let (line, character) = position_of(params);
        let Some(word) = word_at(&text, line, character) else {
            return json!([]);
        };
        let mut locations = Vec::new();
        for (file_uri, file_text) in self.workspace_texts() {
            for (line_index, line_text) in file_text.lines().enumerate() {
                for column in word_occurrences(line_text, &word) {
                    locations.push(json!({
                        "uri": file_uri,
                        "range": {
                            "start": { "line": line_index, "character": column },
                            "end": { "line": line_index, "character": column + word.len() }
                        }
                    }));
                }
            }
        }
        Value::Array(locations)
    }

    fn document_symbols(&self, params: &Value) -> Value {
        let uri = text_document_uri(params);
        let Some(text) = self.text(&uri) else {
            return json!([]);
        };
        let mut symbols: Vec<Value> = Vec::new();
        let lines: Vec<&str> = text.lines().collect();
        let mut starts: Vec<(usize, String, u32, usize)> = Vec::new();
        for (line_index, line_text) in lines.iter().enumerate() {
            if let Some((name, kind, column)) = symbol_declaration(line_text) {
                starts.push((line_index, name, kind, column));
            }
        }
        for (position, (line_index, name, kind, column)) in starts.iter().enumerate() {
            let end_line = starts
                .get(position + 1)
                .map(|next| next.0.saturating_sub(1))
                .unwrap_or(lines.len().saturating_sub(1));
            let end_character = lines.get(end_line).map(|l| l.len()).unwrap_or(0);
            symbols.push(json!({
                "name": name,
                "kind": kind,
                "range": {
                    "start": { "line": line_index, "character": 0 },
                    "end": { "line": end_line, "character": end_character }
                },
                "selectionRange": {
                    "start": { "line": line_index, "character": column },
                    "end": { "line": line_index, "character": column + name.len() }
                },
                "children": []
            }));
        }
        Value::Array(symbols)
    }

    fn completion(&self, params: &Value) -> Value {
        let uri = text_document_uri(params);
        let Some(text) = self.text(&uri) else {
            return json!([]);
        };
        let (line, character) = position_of(params);
        let prefix = word_prefix(&text, line, character).unwrap_or_default();
        let mut labels: Vec<String> = Vec::new();
        for word in identifiers(&text) {
            if (prefix.is_empty() || word.starts_with(&prefix))
                && word != prefix
                && !labels.contains(&word)
            {
                labels.push(word);
            }
        }
        labels.sort();
        let items: Vec<Value> = labels
            .into_iter()
            .map(|label| json!({ "label": label, "kind": 6 }))
            .collect();
        Value::Array(items)
    }

    fn signature_help(&self, params: &Value) -> Value {
        let uri = text_document_uri(params);
        let Some(text) = self.text(&uri) else {
            return Value::Null;
        };
        let (line, character) = position_of(params);
        let line_text = text.lines().nth(line as usize).unwrap_or_default();
        let upto: String = line_text.chars().take(character as usize).collect();
        let Some(open_paren) = upto.rfind('(') else {
            return Value::Null;
        };
        let callee_end = open_paren;
        let callee: String = upto[..callee_end]
            .chars()
            .rev()
            .take_while(|c| is_word_char(*c))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if callee.is_empty() {
            return Value::Null;
        }
        let active_parameter = upto[open_paren..].matches(',').count();

        // find the declaration to reconstruct the parameter list
        for (_, file_text) in self.workspace_texts() {
            for decl_line in file_text.lines() {
                if definition_column(decl_line, &callee).is_some() {
                    let parameters = parameter_list(decl_line);
                    let label = format!("{callee}({})", parameters.join(", "));
                    let parameter_values: Vec<Value> = parameters
                        .iter()
                        .map(|p| json!({ "label": p }))
                        .collect();
                    return json!({
                        "signatures": [{
                            "label": label,
                            "parameters": parameter_values
                        }],
                        "activeSignature": 0,
                        "activeParameter": active_parameter
                    });
                }
            }
        }
        Value::Null
    }

    fn formatting(&self, params: &Value, range: Option<Value>) -> Value {
        let uri = text_document_uri(params);
        let Some(text) = self.text(&uri) else {
            return json!([]);
        };
        let (from, to) = match &range {
            Some(range) => (
                range["start"]["line"].as_u64().unwrap_or(0) as usize,
                range["end"]["line"].as_u64().unwrap_or(u64::MAX) as usize,
            ),
            None => (0, usize::MAX),
        };
        let mut edits = Vec::new();
        for (line_index, line_text) in text.lines().enumerate() {
            if line_index < from || line_index > to {
                continue;
            }
            let trimmed = line_text.trim_end();
            if trimmed.len() != line_text.len() {
                edits.push(json!({
                    "range": {
                        "start": { "line": line_index, "character": trimmed.len() },
                        "end": { "line": line_index, "character": line_text.len() }
                    },
                    "newText": ""
                }));
            }
        }
        Value::Array(edits)
    }

    fn rename(&self, params: &Value) -> Value {
        let uri = text_document_uri(params);
        let Some(text) = self.text(&uri) else {
            return Value::Null;
        };
        let (line, character) = position_of(params);
        let Some(word) = word_at(&text, line, character) else {
            return Value::Null;
        };
        let new_name = params["newName"].as_str().unwrap_or_default();

        let mut changes = serde_json::Map::new();
        for (file_uri, file_text) in self.workspace_texts() {
            let mut edits = Vec::new();
            for (line_index, line_text) in file_text.lines().enumerate() {
                for column in word_occurrences(line_text, &word) {
                    edits.push(json!({
                        "range": {
                            "start": { "line": line_index, "character": column },
                            "end": { "line": line_index, "character": column + word.len() }
                        },
                        "newText": new_name
                    }));
                }
            }
            if !edits.is_empty() {
                changes.insert(file_uri, Value::Array(edits));
            }
        }
        json!({ "changes": changes })
    }

    fn workspace_symbols(&self, params: &Value) -> Value {
        let query = params["query"].as_str().unwrap_or_default().to_lowercase();
        let mut symbols = Vec::new();
        for (file_uri, file_text) in self.workspace_texts() {
            for (line_index, line_text) in file_text.lines().enumerate() {
                if let Some((name, kind, column)) = symbol_declaration(line_text) {
                    if query.is_empty() || name.to_lowercase().contains(&query) {
                        symbols.push(json!({
                            "name": name,
                            "kind": kind,
                            "location": {
                                "uri": file_uri,
                                "range": {
                                    "start": { "line": line_index, "character": column },
                                    "end": { "line": line_index, "character": column + name.len() }
                                }
                            }
                        }));
                    }
                }
            }
        }
        Value::Array(symbols)
    }
}

fn text_document_uri(params: &Value) -> String {
    params["textDocument"]["uri"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn position_of(params: &Value) -> (u32, u32) {
    (
        params["position"]["line"].as_u64().unwrap_or(0) as u32,
        params["position"]["character"].as_u64().unwrap_or(0) as u32,
    )
}

fn uri_to_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

fn path_to_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn word_at(text: &str, line: u32, character: u32) -> Option<String> {
    let line_text = text.lines().nth(line as usize)?;
    let chars: Vec<char> = line_text.chars().collect();
    let mut index = character as usize;
    if index >= chars.len() || !is_word_char(chars[index]) {
        if index > 0 && index <= chars.len() && is_word_char(chars[index - 1]) {
            index -= 1;
        } else {
            return None;
        }
    }
    let mut start = index;
    while start > 0 && is_word_char(chars[start - 1]) {
        start -= 1;
    }
    let mut end = index;
    while end < chars.len() && is_word_char(chars[end]) {
        end += 1;
    }
    Some(chars[start..end].iter().collect())
}

fn word_prefix(text: &str, line: u32, character: u32) -> Option<String> {
    let line_text = text.lines().nth(line as usize)?;
    let chars: Vec<char> = line_text.chars().collect();
    let end = (character as usize).min(chars.len());
    let mut start = end;
    while start > 0 && is_word_char(chars[start - 1]) {
        start -= 1;
    }
    Some(chars[start..end].iter().collect())
}

/// Columns of whole-word occurrences of `word` in `line`.
fn word_occurrences(line: &str, word: &str) -> Vec<usize> {
    let mut columns = Vec::new();
    let bytes = line.as_bytes();
    let mut from = 0;
    while let Some(found) = line[from..].find(word) {
        let start = from + found;
        let end = start + word.len();
        let boundary_before =
            start == 0 || !is_word_char(bytes[start - 1] as char);
        let boundary_after = end >= bytes.len() || !is_word_char(bytes[end] as char);
        if boundary_before && boundary_after {
            columns.push(start);
        }
        from = start + 1;
    }
    columns
}

fn identifiers(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if is_word_char(c) {
            current.push(c);
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// `(name, lsp kind, column)` if the line declares a symbol.
fn symbol_declaration(line: &str) -> Option<(String, u32, usize)> {
    for (keyword, kind) in [
        ("function ", 12u32),
        ("class ", 5),
        ("interface ", 11),
        ("const ", 14),
        ("let ", 13),
        ("fn ", 12),
    ] {
        if let Some(keyword_at) = line.find(keyword) {
            // only honor declarations, not arbitrary mid-line mentions
            let head = line[..keyword_at].trim();
            if !head.is_empty() && head != "export" && head != "export default" && head != "pub" {
                continue;
            }
            let name_start = keyword_at + keyword.len();
            let name: String = line[name_start..]
                .chars()
                .take_while(|c| is_word_char(*c))
                .collect();
            if !name.is_empty() {
                return Some((name, kind, name_start));
            }
        }
    }
    None
}

fn definition_column(line: &str, word: &str) -> Option<usize> {
    let (name, _, column) = symbol_declaration(line)?;
    if name == word { Some(column) } else { None }
}

/// Parameters of a declaration line, e.g. `function greet(n: string)` →
/// `["n: string"]`.
fn parameter_list(line: &str) -> Vec<String> {
    let open = match line.find('(') {
        Some(index) => index,
        None => return Vec::new(),
    };
    let close = line[open..].find(')').map(|i| open + i).unwrap_or(line.len());
    line[open + 1..close]
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Matches `const x: string = 123;`-shaped lines; range covers the value.
fn string_type_mismatch(line: &str, line_index: u32) -> Option<Value> {
    let annotation = ": string = ";
    let annotation_at = line.find(annotation)?;
    let value_start = annotation_at + annotation.len();
    let value: String = line[value_start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if value.is_empty() {
        return None;
    }
    Some(json!({
        "start": { "line": line_index, "character": value_start },
        "end": { "line": line_index, "character": value_start + value.len() }
    }))
}
