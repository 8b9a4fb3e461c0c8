//! Reference-counted server pool.
//!
//! One entry per (canonicalized project root, language id). Concurrent
//! acquires of a cold key collapse into a single spawn via a shared
//! initialization future; the last release drains and stops the process. A
//! dead connection discovered at acquire time evicts the stale entry and
//! respawns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lsp_types::ServerCapabilities;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, LanguageConfig};
use crate::error::{BrokerError, Result};
use crate::lsp::capabilities;
use crate::lsp::client::LspClient;
use crate::lsp::diagnostics::DiagnosticsStore;
use crate::lsp::documents::DocumentSession;

/// How long a draining server gets to exit after `shutdown`/`exit` before it
/// is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub root: PathBuf,
    pub language: &'static str,
}

/// Lifecycle of a live entry. The spawning/initializing phases are
/// represented by the pool's in-flight slot, so an entry only ever exists in
/// one of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Ready,
    Draining,
    Stopped,
}

pub struct ServerEntry {
    pub key: PoolKey,
    pub language: &'static LanguageConfig,
    pub client: Arc<LspClient>,
    pub documents: DocumentSession,
    pub diagnostics: Arc<DiagnosticsStore>,
    pub capabilities: ServerCapabilities,
    child: tokio::sync::Mutex<Option<Child>>,
    refs: AtomicUsize,
    state: parking_lot::Mutex<ServerState>,
    first_open_settled: std::sync::atomic::AtomicBool,
}

impl ServerEntry {
    /// True exactly once: the first document open on this server should wait
    /// out the profile's settling delay.
    pub fn take_first_open(&self) -> bool {
        !self.first_open_settled.swap(true, Ordering::SeqCst)
    }

    pub fn state(&self) -> ServerState {
        if self.client.is_closed() && *self.state.lock() != ServerState::Stopped {
            // fatal transport error: the entry is gone whatever it thought
            *self.state.lock() = ServerState::Stopped;
        }
        *self.state.lock()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    /// Drain: polite `shutdown` + `exit`, then kill after the grace period.
    async fn shutdown(&self) {
        self.set_state(ServerState::Draining);
        let _ = self
            .client
            .request("shutdown", Value::Null, SHUTDOWN_REQUEST_TIMEOUT)
            .await;
        let _ = self.client.notify("exit", Value::Null);

        let mut child_guard = self.child.lock().await;
        if let Some(child) = child_guard.as_mut() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => {
                    debug!(root = %self.key.root.display(), language = self.key.language,
                           status = ?status.ok(), "server exited");
                }
                Err(_) => {
                    warn!(root = %self.key.root.display(), language = self.key.language,
                          "server ignored shutdown; killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        *child_guard = None;
        self.set_state(ServerState::Stopped);
    }
}

type InitResult = std::result::Result<Arc<ServerEntry>, BrokerError>;
type InitFuture = Shared<BoxFuture<'static, InitResult>>;

enum PoolSlot {
    Ready(Arc<ServerEntry>),
    InFlight(InitFuture),
}

pub struct ServerPool {
    config: Arc<BrokerConfig>,
    slots: parking_lot::Mutex<HashMap<PoolKey, PoolSlot>>,
    spawned_total: Arc<AtomicUsize>,
}

impl ServerPool {
    pub fn new(config: Arc<BrokerConfig>) -> Self {
        Self {
            config,
            slots: parking_lot::Mutex::new(HashMap::new()),
            spawned_total: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of live entries (ready or initializing).
    pub fn size(&self) -> usize {
        self.slots.lock().len()
    }

    /// Total processes ever spawned; the single-flight invariant makes this
    /// observable.
    pub fn spawn_count(&self) -> usize {
        self.spawned_total.load(Ordering::SeqCst)
    }

    /// Get or create the server entry for `(root, lang)`, incrementing its
    /// reference count. Every successful acquire must be paired with a
    /// [`ServerPool::release`].
    pub async fn acquire(
        &self,
        root: &Path,
        lang: &'static LanguageConfig,
    ) -> Result<Arc<ServerEntry>> {
        let root = std::fs::canonicalize(root).map_err(|e| BrokerError::from_io(root, e))?;
        let key = PoolKey {
            root,
            language: lang.id,
        };

        loop {
            let action = {
                let mut slots = self.slots.lock();
                match slots.get(&key) {
                    Some(PoolSlot::Ready(entry)) => {
                        if entry.client.is_closed() {
                            debug!(root = %key.root.display(), language = lang.id,
                                   "evicting dead server entry");
                            slots.remove(&key);
                            continue;
                        }
                        entry.refs.fetch_add(1, Ordering::SeqCst);
                        return Ok(entry.clone());
                    }
                    Some(PoolSlot::InFlight(future)) => Action::Await(future.clone()),
                    None => {
                        let future = spawn_entry(
                            self.config.clone(),
                            key.clone(),
                            lang,
                            self.spawned_total.clone(),
                        )
                        .boxed()
                        .shared();
                        slots.insert(key.clone(), PoolSlot::InFlight(future.clone()));
                        Action::Drive(future)
                    }
                }
            };

            match action {
                Action::Await(future) => match future.await {
                    Ok(entry) => {
                        let usable = {
                            let mut slots = self.slots.lock();
                            if entry.client.is_closed() {
                                // drop a stale in-flight slot so the retry
                                // respawns instead of re-awaiting this result
                                if matches!(slots.get(&key), Some(PoolSlot::InFlight(_))) {
                                    slots.remove(&key);
                                }
                                false
                            } else {
                                entry.refs.fetch_add(1, Ordering::SeqCst);
                                // promote even if the driving task was
                                // cancelled before it could
                                if matches!(slots.get(&key), Some(PoolSlot::InFlight(_))) {
                                    slots.insert(key.clone(), PoolSlot::Ready(entry.clone()));
                                }
                                true
                            }
                        };
                        if usable {
                            return Ok(entry);
                        }
                        // initialization raced with a fatal error; retry
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                Action::Drive(future) => {
                    let result = future.await;
                    let mut slots = self.slots.lock();
                    match &result {
                        Ok(entry) => {
                            entry.refs.fetch_add(1, Ordering::SeqCst);
                            slots.insert(key.clone(), PoolSlot::Ready(entry.clone()));
                        }
                        Err(_) => {
                            slots.remove(&key);
                        }
                    }
                    return result;
                }
            }
        }
    }

    /// Decrement an entry's reference count; the last holder triggers drain
    /// and process teardown.
    pub async fn release(&self, entry: &Arc<ServerEntry>) {
        let prev = entry.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "release without matching acquire");
        if prev > 1 {
            return;
        }

        let should_stop = {
            let mut slots = self.slots.lock();
            match slots.get(&entry.key) {
                Some(PoolSlot::Ready(current))
                    if Arc::ptr_eq(current, entry)
                        && entry.refs.load(Ordering::SeqCst) == 0 =>
                {
                    slots.remove(&entry.key);
                    true
                }
                _ => false,
            }
        };
        if should_stop {
            info!(root = %entry.key.root.display(), language = entry.key.language,
                  "last reference released; stopping server");
            entry.shutdown().await;
        }
    }

    /// Synchronous release for drop guards: defers the actual teardown onto
    /// the runtime.
    pub fn release_detached(self: &Arc<Self>, entry: Arc<ServerEntry>) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.release(&entry).await;
        });
    }

    /// Stop every server regardless of reference counts. Used at process
    /// shutdown.
    pub async fn shutdown_all(&self) {
        let entries: Vec<Arc<ServerEntry>> = {
            let mut slots = self.slots.lock();
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    PoolSlot::Ready(entry) => Some(entry),
                    PoolSlot::InFlight(_) => None,
                })
                .collect()
        };
        for entry in entries {
            entry.shutdown().await;
        }
    }
}

enum Action {
    Await(InitFuture),
    Drive(InitFuture),
}

/// Spawn the configured server process, wire a client over its stdio, and run
/// the C5 handshake. On failure the child is killed before the error
/// surfaces.
async fn spawn_entry(
    config: Arc<BrokerConfig>,
    key: PoolKey,
    lang: &'static LanguageConfig,
    spawned_total: Arc<AtomicUsize>,
) -> InitResult {
    let command_line = config.server_command_for(lang);
    let (program, args) = command_line
        .split_first()
        .ok_or_else(|| BrokerError::InvalidArgument("empty server command".into()))?;

    info!(root = %key.root.display(), language = lang.id, command = %program, "spawning server");
    let mut child = Command::new(program)
        .args(args)
        .current_dir(&key.root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BrokerError::Transport(format!("failed to spawn {program}: {e}")))?;
    spawned_total.fetch_add(1, Ordering::SeqCst);

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BrokerError::Transport("failed to capture server stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BrokerError::Transport("failed to capture server stdout".into()))?;
    if let Some(stderr) = child.stderr.take() {
        let name = program.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %name, "stderr: {line}");
            }
        });
    }

    let diagnostics = Arc::new(DiagnosticsStore::new());
    let client = LspClient::start(program.clone(), stdout, stdin, diagnostics.clone());

    let negotiated = match capabilities::initialize(&client, &key.root, lang).await {
        Ok(caps) => caps,
        Err(e) => {
            warn!(root = %key.root.display(), language = lang.id, error = %e,
                  "handshake failed; killing server");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }
    };

    let documents = DocumentSession::new(client.clone(), diagnostics.clone());
    let entry = Arc::new(ServerEntry {
        key: key.clone(),
        language: lang,
        client,
        documents,
        diagnostics,
        capabilities: negotiated,
        child: tokio::sync::Mutex::new(Some(child)),
        refs: AtomicUsize::new(0),
        state: parking_lot::Mutex::new(ServerState::Ready),
        first_open_settled: std::sync::atomic::AtomicBool::new(false),
    });

    capabilities::warm_up(&entry.documents, &key.root, lang).await;
    Ok(entry)
}
