//! Push-diagnostic aggregation.
//!
//! The store holds the latest `publishDiagnostics` payload per URI and lets
//! callers block until the next one arrives. Pull diagnostics
//! (`textDocument/diagnostic`) live at the session layer because they need a
//! request channel; this store is purely notification-fed.

use std::time::Duration;

use dashmap::DashMap;
use lsp_types::{Diagnostic, Url};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{BrokerError, Result};

/// Capacity for the publish broadcast; a burst beyond this only costs a
/// waiter a re-check, not a lost snapshot.
const PUBLISH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct DiagnosticsStore {
    latest: DashMap<Url, Vec<Diagnostic>>,
    published: broadcast::Sender<Url>,
}

impl Default for DiagnosticsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        let (published, _) = broadcast::channel(PUBLISH_CHANNEL_CAPACITY);
        Self {
            latest: DashMap::new(),
            published,
        }
    }

    /// Record a `publishDiagnostics` payload, replacing the previous snapshot
    /// for the URI. Diagnostics with an empty range are dropped.
    pub fn record(&self, uri: Url, diagnostics: Vec<Diagnostic>) {
        let kept: Vec<Diagnostic> = diagnostics
            .into_iter()
            .filter(|d| d.range.start != d.range.end)
            .collect();
        trace!(uri = %uri, count = kept.len(), "recorded diagnostics");
        self.latest.insert(uri.clone(), kept);
        let _ = self.published.send(uri);
    }

    /// Latest snapshot for `uri`; empty if nothing has been published.
    pub fn get(&self, uri: &Url) -> Vec<Diagnostic> {
        self.latest.get(uri).map(|d| d.clone()).unwrap_or_default()
    }

    /// Whether any publish has been recorded for `uri` (an empty list from a
    /// clean file still counts).
    pub fn has_snapshot(&self, uri: &Url) -> bool {
        self.latest.contains_key(uri)
    }

    pub fn clear(&self, uri: &Url) {
        self.latest.remove(uri);
    }

    /// Resolve on the next `publishDiagnostics` for `uri`.
    pub async fn wait_for(&self, uri: &Url, timeout: Duration) -> Result<Vec<Diagnostic>> {
        let mut rx = self.published.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, rx.recv()).await;
            match next {
                Ok(Ok(published_uri)) if &published_uri == uri => return Ok(self.get(uri)),
                Ok(Ok(_)) => continue,
                // Lagged just means we missed intermediate publishes; the
                // stored snapshot is still the latest one.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => return Ok(self.get(uri)),
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(BrokerError::Transport(
                        "diagnostics channel closed".into(),
                    ));
                }
                Err(_) => {
                    return Err(BrokerError::Timeout {
                        method: "textDocument/publishDiagnostics".into(),
                        after: timeout,
                    });
                }
            }
        }
    }
}

/// Pull diagnostics with fallback: ask `textDocument/diagnostic` when the
/// server advertises it, otherwise (or when the server turns out not to
/// honor it) return the latest push snapshot.
pub async fn pull(
    client: &crate::lsp::client::LspClient,
    store: &DiagnosticsStore,
    supports_pull: bool,
    uri: &Url,
    timeout: Duration,
) -> Result<Vec<Diagnostic>> {
    if !supports_pull {
        return Ok(store.get(uri));
    }
    let params = serde_json::json!({ "textDocument": { "uri": uri } });
    match client.request("textDocument/diagnostic", params, timeout).await {
        Ok(report) => match report.get("kind").and_then(|k| k.as_str()) {
            Some("full") => {
                let items: Vec<Diagnostic> = report
                    .get("items")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| {
                        BrokerError::Transport(format!("malformed diagnostic report: {e}"))
                    })?
                    .unwrap_or_default();
                store.record(uri.clone(), items);
                Ok(store.get(uri))
            }
            // "unchanged" or anything unexpected: the snapshot stands
            _ => Ok(store.get(uri)),
        },
        Err(BrokerError::Unsupported(_)) => Ok(store.get(uri)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Position, Range};

    fn diag(start: (u32, u32), end: (u32, u32), message: &str) -> Diagnostic {
        Diagnostic {
            range: Range {
                start: Position {
                    line: start.0,
                    character: start.1,
                },
                end: Position {
                    line: end.0,
                    character: end.1,
                },
            },
            message: message.to_string(),
            ..Default::default()
        }
    }

    fn uri() -> Url {
        Url::parse("file:///tmp/a.ts").unwrap()
    }

    #[test]
    fn latest_snapshot_replaces_previous() {
        let store = DiagnosticsStore::new();
        store.record(uri(), vec![diag((0, 0), (0, 5), "first")]);
        store.record(uri(), vec![diag((1, 0), (1, 3), "second")]);
        let snapshot = store.get(&uri());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message, "second");
    }

    #[test]
    fn empty_range_diagnostics_are_dropped() {
        let store = DiagnosticsStore::new();
        store.record(
            uri(),
            vec![diag((2, 4), (2, 4), "zero width"), diag((0, 0), (0, 1), "kept")],
        );
        let snapshot = store.get(&uri());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message, "kept");
    }

    #[tokio::test]
    async fn wait_for_resolves_on_publish() {
        let store = std::sync::Arc::new(DiagnosticsStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for(&uri(), Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        store.record(uri(), vec![diag((0, 0), (0, 2), "pushed")]);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let store = DiagnosticsStore::new();
        let err = store.wait_for(&uri(), Duration::from_millis(20)).await;
        assert!(matches!(err, Err(BrokerError::Timeout { .. })));
    }

    #[test]
    fn clear_removes_snapshot() {
        let store = DiagnosticsStore::new();
        store.record(uri(), vec![diag((0, 0), (0, 1), "x")]);
        store.clear(&uri());
        assert!(store.get(&uri()).is_empty());
    }
}
