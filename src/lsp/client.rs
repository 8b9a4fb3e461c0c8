//! JSON-RPC client for a single language server connection.
//!
//! One reader task drains framed messages from the server's output stream and
//! routes them: responses to pending callers, notifications to the
//! diagnostics store and the log, server-initiated requests to a small
//! handler. One writer task owns the input stream so outgoing messages are
//! never interleaved.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use lsp_types::{
    ApplyWorkspaceEditParams, LogMessageParams, MessageType, PublishDiagnosticsParams,
    ShowMessageParams,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::error::{BrokerError, Result};
use crate::lsp::diagnostics::DiagnosticsStore;
use crate::lsp::framing::{FrameDecoder, encode_message};

/// Longest wire-log body prefix at trace level.
const TRACE_BODY_PREFIX: usize = 256;

struct Pending {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

struct Shared {
    name: String,
    pending: DashMap<i64, Pending>,
    diagnostics: Arc<DiagnosticsStore>,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn send_raw(&self, message: &Value) -> Result<()> {
        trace!(server = %self.name, body = %truncated(message), "-->");
        self.writer_tx
            .send(encode_message(message))
            .map_err(|_| BrokerError::Transport("server connection closed".into()))
    }

    fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending
                    .tx
                    .send(Err(BrokerError::Transport(reason.to_string())));
            }
        }
    }

    fn mark_closed(&self, reason: &str) {
        if !*self.closed_tx.borrow() {
            debug!(server = %self.name, reason, "connection closed");
        }
        let _ = self.closed_tx.send(true);
        self.fail_all_pending(reason);
    }
}

/// Notification shapes the client reacts to, parsed in a single pass.
#[derive(Deserialize)]
#[serde(tag = "method")]
enum ServerNotification {
    #[serde(rename = "textDocument/publishDiagnostics")]
    PublishDiagnostics { params: PublishDiagnosticsParams },

    #[serde(rename = "window/logMessage")]
    LogMessage { params: LogMessageParams },

    #[serde(rename = "window/showMessage")]
    ShowMessage { params: ShowMessageParams },

    #[serde(other)]
    Other,
}

pub struct LspClient {
    shared: Arc<Shared>,
    next_id: AtomicI64,
    closed_rx: watch::Receiver<bool>,
}

impl LspClient {
    /// Wire up a client over a server's output/input streams and spawn its
    /// reader and writer tasks. Generic so tests can use in-memory duplex
    /// streams instead of child process pipes.
    pub fn start<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        diagnostics: Arc<DiagnosticsStore>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            name,
            pending: DashMap::new(),
            diagnostics,
            writer_tx,
            closed_tx,
        });

        tokio::spawn(writer_loop(shared.clone(), writer, writer_rx));
        tokio::spawn(reader_loop(shared.clone(), reader));

        Arc::new(Self {
            shared,
            next_id: AtomicI64::new(1),
            closed_rx,
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolve once the connection is gone (server exit or stream error).
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Send a request and await its response, bounded by `timeout`.
    ///
    /// On timeout the pending entry is dropped and `$/cancelRequest` is sent
    /// for cooperative servers. A `-32601` response surfaces as
    /// [`BrokerError::Unsupported`] so callers can fall back.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(BrokerError::Transport("server connection closed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(
            id,
            Pending {
                method: method.to_string(),
                tx,
            },
        );

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.shared.send_raw(&message) {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Transport("server connection closed".into())),
            Err(_) => {
                self.shared.pending.remove(&id);
                let _ = self.notify("$/cancelRequest", json!({ "id": id }));
                Err(BrokerError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.shared.send_raw(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsStore> {
        &self.shared.diagnostics
    }
}

async fn writer_loop<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            shared.mark_closed(&format!("write failed: {e}"));
            return;
        }
        if let Err(e) = writer.flush().await {
            shared.mark_closed(&format!("flush failed: {e}"));
            return;
        }
    }
}

async fn reader_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                shared.mark_closed("server closed its output stream");
                return;
            }
            Ok(n) => decoder.push(&chunk[..n]),
            Err(e) => {
                shared.mark_closed(&format!("read failed: {e}"));
                return;
            }
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(body)) => dispatch(&shared, &body),
                Ok(None) => break,
                Err(e) => warn!(server = %shared.name, error = %e, "malformed frame"),
            }
        }
    }
}

fn dispatch(shared: &Arc<Shared>, body: &[u8]) {
    let message: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(server = %shared.name, error = %e, "discarding unparseable message body");
            return;
        }
    };
    trace!(server = %shared.name, body = %truncated(&message), "<--");

    let has_id = message.get("id").is_some();
    let has_method = message.get("method").is_some();

    if has_id && !has_method {
        route_response(shared, &message);
    } else if has_id && has_method {
        handle_server_request(shared, message);
    } else if has_method {
        handle_notification(shared, body);
    } else {
        warn!(server = %shared.name, "message is neither request, response, nor notification");
    }
}

fn route_response(shared: &Arc<Shared>, message: &Value) {
    let Some(id) = message.get("id").and_then(Value::as_i64) else {
        warn!(server = %shared.name, "response with non-numeric id");
        return;
    };
    let Some((_, pending)) = shared.pending.remove(&id) else {
        // late reply after a timeout already removed the entry
        trace!(server = %shared.name, id, "response for unknown request id");
        return;
    };

    let outcome = if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let text = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown server error")
            .to_string();
        if code == -32601 {
            Err(BrokerError::Unsupported(format!(
                "server does not support {}",
                pending.method
            )))
        } else {
            Err(BrokerError::ServerError {
                code,
                message: text,
            })
        }
    } else {
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = pending.tx.send(outcome);
}

fn handle_notification(shared: &Arc<Shared>, body: &[u8]) {
    let notification: ServerNotification = match serde_json::from_slice(body) {
        Ok(n) => n,
        Err(e) => {
            warn!(server = %shared.name, error = %e, "failed to parse notification");
            return;
        }
    };
    match notification {
        ServerNotification::PublishDiagnostics { params } => {
            shared.diagnostics.record(params.uri, params.diagnostics);
        }
        ServerNotification::LogMessage { params } => log_server_message(shared, &params),
        ServerNotification::ShowMessage { params } => {
            let as_log = LogMessageParams {
                typ: params.typ,
                message: params.message,
            };
            log_server_message(shared, &as_log);
        }
        ServerNotification::Other => {}
    }
}

fn log_server_message(shared: &Arc<Shared>, params: &LogMessageParams) {
    match params.typ {
        MessageType::ERROR => warn!(server = %shared.name, "{}", params.message),
        MessageType::WARNING => warn!(server = %shared.name, "{}", params.message),
        _ => debug!(server = %shared.name, "{}", params.message),
    }
}

/// Server-initiated requests. Only methods the client capabilities advertise
/// are honored; everything else is answered with method-not-found.
fn handle_server_request(shared: &Arc<Shared>, message: Value) {
    let shared = shared.clone();
    tokio::spawn(async move {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let reply = match method.as_str() {
            "workspace/applyEdit" => apply_edit_from_server(&shared, params).await,
            "workspace/configuration" => {
                let len = params
                    .get("items")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                Ok(Value::Array(vec![Value::Null; len]))
            }
            "window/workDoneProgress/create"
            | "client/registerCapability"
            | "client/unregisterCapability" => Ok(Value::Null),
            other => {
                debug!(server = %shared.name, method = other, "refusing unadvertised server request");
                Err((-32601, format!("method not found: {other}")))
            }
        };

        let response = match reply {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, text)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": text },
            }),
        };
        let _ = shared.send_raw(&response);
    });
}

async fn apply_edit_from_server(
    shared: &Arc<Shared>,
    params: Value,
) -> std::result::Result<Value, (i64, String)> {
    let params: ApplyWorkspaceEditParams = serde_json::from_value(params)
        .map_err(|e| (-32602, format!("invalid applyEdit params: {e}")))?;
    let server = shared.name.clone();
    let applied = tokio::task::spawn_blocking(move || {
        crate::edits::apply_workspace_edit(&params.edit)
    })
    .await;
    match applied {
        Ok(Ok(changes)) => {
            debug!(server = %server, files = changes.len(), "applied server-initiated edit");
            Ok(json!({ "applied": true }))
        }
        Ok(Err(e)) => {
            warn!(server = %server, error = %e, "failed to apply server-initiated edit");
            Ok(json!({ "applied": false, "failureReason": e.to_string() }))
        }
        Err(join) => Ok(json!({ "applied": false, "failureReason": join.to_string() })),
    }
}

fn truncated(message: &Value) -> String {
    let mut text = message.to_string();
    if text.len() > TRACE_BODY_PREFIX {
        let mut cut = TRACE_BODY_PREFIX;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Diagnostic, Position, Range, Url};
    use tokio::io::DuplexStream;

    /// Minimal scripted server on the far end of a duplex pipe.
    struct FakeServer {
        reader: DuplexStream,
        writer: DuplexStream,
        decoder: FrameDecoder,
    }

    impl FakeServer {
        async fn next_message(&mut self) -> Value {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some(body) = self.decoder.next_frame().unwrap() {
                    return serde_json::from_slice(&body).unwrap();
                }
                let n = self.reader.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed stream");
                self.decoder.push(&chunk[..n]);
            }
        }

        async fn send(&mut self, message: Value) {
            self.writer
                .write_all(&encode_message(&message))
                .await
                .unwrap();
        }
    }

    fn connect() -> (Arc<LspClient>, FakeServer, Arc<DiagnosticsStore>) {
        let (client_read, server_write) = tokio::io::duplex(64 * 1024);
        let (server_read, client_write) = tokio::io::duplex(64 * 1024);
        let diagnostics = Arc::new(DiagnosticsStore::new());
        let client = LspClient::start("fake", client_read, client_write, diagnostics.clone());
        let server = FakeServer {
            reader: server_read,
            writer: server_write,
            decoder: FrameDecoder::new(),
        };
        (client, server, diagnostics)
    }

    #[tokio::test]
    async fn correlates_out_of_order_responses() {
        let (client, mut server, _) = connect();

        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("one", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let req1 = server.next_message().await;
        let second = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("two", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let req2 = server.next_message().await;

        // answer in reverse order
        server
            .send(json!({"jsonrpc": "2.0", "id": req2["id"], "result": "second"}))
            .await;
        server
            .send(json!({"jsonrpc": "2.0", "id": req1["id"], "result": "first"}))
            .await;

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn timeout_sends_cancel_and_fails() {
        let (client, mut server, _) = connect();
        let result = client
            .request("slow/method", json!({}), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(BrokerError::Timeout { .. })));

        let request = server.next_message().await;
        assert_eq!(request["method"], "slow/method");
        let cancel = server.next_message().await;
        assert_eq!(cancel["method"], "$/cancelRequest");
        assert_eq!(cancel["params"]["id"], request["id"]);
    }

    #[tokio::test]
    async fn method_not_found_maps_to_unsupported() {
        let (client, mut server, _) = connect();
        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("textDocument/rename", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let request = server.next_message().await;
        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32601, "message": "unhandled method"},
            }))
            .await;
        let result = pending.await.unwrap();
        match result {
            Err(BrokerError::Unsupported(message)) => {
                assert!(message.contains("textDocument/rename"));
            }
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_exit_fails_pending_requests() {
        let (client, server, _) = connect();
        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request("anything", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        drop(server);
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Transport(_))));
        client.wait_closed().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn publish_diagnostics_reaches_store() {
        let (_client, mut server, diagnostics) = connect();
        let uri = Url::parse("file:///tmp/x.rs").unwrap();
        let diagnostic = Diagnostic {
            range: Range {
                start: Position {
                    line: 0,
                    character: 0,
                },
                end: Position {
                    line: 0,
                    character: 4,
                },
            },
            message: "boom".into(),
            ..Default::default()
        };
        server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {"uri": uri, "diagnostics": [diagnostic]},
            }))
            .await;

        // the notification may land before or after we start looking; poll
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let got = diagnostics.get(&uri);
            if !got.is_empty() {
                assert_eq!(got[0].message, "boom");
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "diagnostics never arrived"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn unknown_server_request_gets_method_not_found() {
        let (_client, mut server, _) = connect();
        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 99,
                "method": "workspace/untrusted",
                "params": {},
            }))
            .await;
        let reply = server.next_message().await;
        assert_eq!(reply["id"], 99);
        assert_eq!(reply["error"]["code"], -32601);
    }
}
