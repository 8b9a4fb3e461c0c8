//! Open-document tracking and text synchronization.
//!
//! The session owns the set of documents currently open on one server
//! connection and their versions. Sync is full-text: every update ships the
//! whole document, which every server accepts and which keeps the version
//! bookkeeping trivial.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem, Url,
    VersionedTextDocumentIdentifier,
};
use serde_json::to_value;
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::lsp::client::LspClient;
use crate::lsp::diagnostics::DiagnosticsStore;

pub struct DocumentSession {
    client: Arc<LspClient>,
    diagnostics: Arc<DiagnosticsStore>,
    open: DashMap<Url, i32>,
}

impl DocumentSession {
    pub fn new(client: Arc<LspClient>, diagnostics: Arc<DiagnosticsStore>) -> Self {
        Self {
            client,
            diagnostics,
            open: DashMap::new(),
        }
    }

    pub fn is_open(&self, uri: &Url) -> bool {
        self.open.contains_key(uri)
    }

    pub fn version(&self, uri: &Url) -> Option<i32> {
        self.open.get(uri).map(|v| *v)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Emit `didOpen` at version 1. Fails if the document is already open.
    pub fn open(&self, uri: &Url, text: &str, language_id: &str) -> Result<()> {
        match self.open.entry(uri.clone()) {
            dashmap::Entry::Occupied(_) => {
                return Err(BrokerError::InvalidArgument(format!(
                    "document already open: {uri}"
                )));
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(1);
            }
        }
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id.to_string(),
                version: 1,
                text: text.to_string(),
            },
        };
        debug!(uri = %uri, language = language_id, "didOpen");
        self.client
            .notify("textDocument/didOpen", to_value(params).unwrap())
    }

    /// Emit a full-text `didChange` with a strictly increased version.
    /// Fails if the document is not open.
    pub fn update(&self, uri: &Url, text: &str) -> Result<()> {
        let version = {
            let mut entry = self.open.get_mut(uri).ok_or_else(|| {
                BrokerError::InvalidArgument(format!("document not open: {uri}"))
            })?;
            *entry += 1;
            *entry
        };
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri.clone(),
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.to_string(),
            }],
        };
        debug!(uri = %uri, version, "didChange");
        self.client
            .notify("textDocument/didChange", to_value(params).unwrap())
    }

    /// Emit `didClose`, drop the version, and clear stored diagnostics.
    pub fn close(&self, uri: &Url) -> Result<()> {
        if self.open.remove(uri).is_none() {
            return Err(BrokerError::InvalidArgument(format!(
                "document not open: {uri}"
            )));
        }
        self.diagnostics.clear(uri);
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
        };
        debug!(uri = %uri, "didClose");
        self.client
            .notify("textDocument/didClose", to_value(params).unwrap())
    }

    /// Run `op` with the document open, closing it afterwards iff this call
    /// opened it. `op` receives whether the open was fresh, so callers can
    /// apply the first-open settling delay only when it matters.
    ///
    /// The close runs on success and on failure alike.
    pub async fn with_temporary_document<T, F, Fut>(
        &self,
        uri: &Url,
        text: &str,
        language_id: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let newly_opened = if self.is_open(uri) {
            false
        } else {
            self.open(uri, text, language_id)?;
            true
        };

        let result = op(newly_opened).await;

        if newly_opened {
            if let Err(e) = self.close(uri) {
                warn!(uri = %uri, error = %e, "failed to close temporary document");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::framing::FrameDecoder;
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct ServerEnd {
        reader: DuplexStream,
        _writer: DuplexStream,
        decoder: FrameDecoder,
    }

    impl ServerEnd {
        async fn next_message(&mut self) -> Value {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some(body) = self.decoder.next_frame().unwrap() {
                    return serde_json::from_slice(&body).unwrap();
                }
                let n = self.reader.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                self.decoder.push(&chunk[..n]);
            }
        }
    }

    fn session() -> (DocumentSession, ServerEnd) {
        let (client_read, server_write) = tokio::io::duplex(64 * 1024);
        let (server_read, client_write) = tokio::io::duplex(64 * 1024);
        let diagnostics = Arc::new(DiagnosticsStore::new());
        let client = LspClient::start("fake", client_read, client_write, diagnostics.clone());
        (
            DocumentSession::new(client, diagnostics),
            ServerEnd {
                reader: server_read,
                _writer: server_write,
                decoder: FrameDecoder::new(),
            },
        )
    }

    fn uri() -> Url {
        Url::parse("file:///tmp/main.rs").unwrap()
    }

    #[tokio::test]
    async fn open_change_close_in_order_with_monotonic_versions() {
        let (session, mut server) = session();
        session.open(&uri(), "fn main() {}", "rust").unwrap();
        session.update(&uri(), "fn main() { run() }").unwrap();
        session.update(&uri(), "fn main() { run(); }").unwrap();
        session.close(&uri()).unwrap();

        let open = server.next_message().await;
        assert_eq!(open["method"], "textDocument/didOpen");
        assert_eq!(open["params"]["textDocument"]["version"], 1);

        let change1 = server.next_message().await;
        assert_eq!(change1["method"], "textDocument/didChange");
        assert_eq!(change1["params"]["textDocument"]["version"], 2);

        let change2 = server.next_message().await;
        assert_eq!(change2["params"]["textDocument"]["version"], 3);

        let close = server.next_message().await;
        assert_eq!(close["method"], "textDocument/didClose");
    }

    #[tokio::test]
    async fn double_open_is_rejected() {
        let (session, _server) = session();
        session.open(&uri(), "", "rust").unwrap();
        let err = session.open(&uri(), "", "rust");
        assert!(matches!(err, Err(BrokerError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn change_on_unopened_document_is_rejected() {
        let (session, _server) = session();
        let err = session.update(&uri(), "text");
        assert!(matches!(err, Err(BrokerError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn open_close_restores_prior_state() {
        let (session, _server) = session();
        assert!(!session.is_open(&uri()));
        session.open(&uri(), "x", "rust").unwrap();
        assert_eq!(session.version(&uri()), Some(1));
        session.close(&uri()).unwrap();
        assert!(!session.is_open(&uri()));
        assert_eq!(session.open_count(), 0);
    }

    #[tokio::test]
    async fn close_clears_diagnostics() {
        let (session, _server) = session();
        session.open(&uri(), "x", "rust").unwrap();
        session.diagnostics.record(
            uri(),
            vec![lsp_types::Diagnostic {
                range: lsp_types::Range {
                    start: lsp_types::Position {
                        line: 0,
                        character: 0,
                    },
                    end: lsp_types::Position {
                        line: 0,
                        character: 1,
                    },
                },
                message: "stale".into(),
                ..Default::default()
            }],
        );
        session.close(&uri()).unwrap();
        assert!(session.diagnostics.get(&uri()).is_empty());
    }

    #[tokio::test]
    async fn temporary_document_closes_only_if_it_opened() {
        let (session, mut server) = session();

        // not previously open: helper opens and closes around the op
        let reported: bool = session
            .with_temporary_document(&uri(), "x", "rust", |fresh| async move { Ok(fresh) })
            .await
            .unwrap();
        assert!(reported);
        assert!(!session.is_open(&uri()));

        // already open: helper leaves it open
        session.open(&uri(), "x", "rust").unwrap();
        let reported: bool = session
            .with_temporary_document(&uri(), "x", "rust", |fresh| async move { Ok(fresh) })
            .await
            .unwrap();
        assert!(!reported);
        assert!(session.is_open(&uri()));

        // closes even when the op fails
        session.close(&uri()).unwrap();
        let failed: Result<()> = session
            .with_temporary_document(&uri(), "x", "rust", |_| async {
                Err(BrokerError::Unsupported("nope".into()))
            })
            .await;
        assert!(failed.is_err());
        assert!(!session.is_open(&uri()));

        // drain so writes never block
        let _ = server.next_message().await;
    }
}
