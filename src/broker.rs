//! The broker context: every tool handler receives one of these instead of
//! reaching for global state.
//!
//! The scoped helpers implement the canonical request lifecycle: resolve
//! root, acquire a pooled server, open the document (settling after the
//! first open on a fresh server), run the operation under the language's
//! timeout, then close transient documents and release the pool reference on
//! success and failure alike.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lsp_types::Url;
use scopeguard::ScopeGuard;
use serde_json::Value;
use tracing::debug;

use crate::config::{BrokerConfig, LanguageConfig, language_id_for_path};
use crate::error::{BrokerError, Result};
use crate::index::SymbolIndexService;
use crate::lsp::pool::{ServerEntry, ServerPool};

pub struct Broker {
    config: Arc<BrokerConfig>,
    pool: Arc<ServerPool>,
    index: Arc<SymbolIndexService>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let config = Arc::new(config);
        Arc::new_cyclic(|weak| Broker {
            config: config.clone(),
            pool: Arc::new(ServerPool::new(config.clone())),
            index: SymbolIndexService::new(weak.clone()),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn index(&self) -> &Arc<SymbolIndexService> {
        &self.index
    }

    /// Persist caches and stop every server. Called once at process exit.
    pub async fn shutdown(&self) {
        if let Err(e) = self.index.persist_all() {
            tracing::warn!(error = %e, "failed to persist symbol caches at shutdown");
        }
        self.pool.shutdown_all().await;
    }

    /// Acquire a server for `(root, language)`, run `op`, release on every
    /// exit path (a drop guard covers cancellation).
    pub async fn with_project<T, F, Fut>(
        &self,
        root: &Path,
        language: &'static LanguageConfig,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(ProjectContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let root = std::fs::canonicalize(root).map_err(|e| BrokerError::from_io(root, e))?;
        let entry = self.pool.acquire(&root, language).await?;

        let pool = self.pool.clone();
        let guard = scopeguard::guard(entry.clone(), move |entry| {
            // reached only if the caller's future was dropped mid-flight
            pool.release_detached(entry);
        });

        let context = ProjectContext {
            entry: entry.clone(),
            root: root.clone(),
        };
        let result = op(context).await;

        let entry = ScopeGuard::into_inner(guard);
        self.pool.release(&entry).await;
        result
    }

    /// The single-document variant: resolve the file, infer its language,
    /// and run `op` with the document transiently open.
    pub async fn with_document<T, F, Fut>(&self, root: &Path, file: &Path, op: F) -> Result<T>
    where
        F: FnOnce(DocumentContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let language = {
            let probe = if file.is_absolute() {
                file.to_path_buf()
            } else {
                root.join(file)
            };
            self.config.resolve_language(&probe)?
        };
        let file = file.to_path_buf();
        self.with_project(root, language, |project| async move {
            project.with_file(&file, op).await
        })
        .await
    }
}

/// An acquired server plus the canonical root, handed to multi-document
/// operations.
#[derive(Clone)]
pub struct ProjectContext {
    pub entry: Arc<ServerEntry>,
    pub root: PathBuf,
}

impl ProjectContext {
    /// Absolute path and URI for a root-relative file, verified to exist.
    pub fn resolve_file(&self, file: &Path) -> Result<(PathBuf, Url)> {
        let path = if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        };
        let path = std::fs::canonicalize(&path).map_err(|e| BrokerError::from_io(&path, e))?;
        let uri = Url::from_file_path(&path).map_err(|()| {
            BrokerError::InvalidArgument(format!("not an absolute path: {}", path.display()))
        })?;
        Ok((path, uri))
    }

    /// Open `file` transiently (read from disk), settle if this is the
    /// server's first open, run `op`, close iff this call opened it.
    pub async fn with_file<T, F, Fut>(&self, file: &Path, op: F) -> Result<T>
    where
        F: FnOnce(DocumentContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (path, uri) = self.resolve_file(file)?;
        let text =
            std::fs::read_to_string(&path).map_err(|e| BrokerError::from_io(&path, e))?;
        let text = Arc::new(text);

        let context = DocumentContext {
            entry: self.entry.clone(),
            root: self.root.clone(),
            path,
            uri: uri.clone(),
            text: text.clone(),
        };

        let entry = self.entry.clone();
        let language_id = language_id_for_path(&context.path);
        entry
            .documents
            .with_temporary_document(&uri, &text, language_id, |_fresh| {
                let context = context.clone();
                let entry = entry.clone();
                async move {
                    if entry.take_first_open() {
                        settle(&entry, &context.uri).await;
                    }
                    op(context).await
                }
            })
            .await
    }
}

/// Everything an LSP operation on one document needs.
#[derive(Clone)]
pub struct DocumentContext {
    pub entry: Arc<ServerEntry>,
    pub root: PathBuf,
    pub path: PathBuf,
    pub uri: Url,
    pub text: Arc<String>,
}

impl DocumentContext {
    pub fn timeout(&self) -> std::time::Duration {
        self.entry.language.profile.request_timeout
    }

    /// Issue a request on this document's server under the language profile
    /// timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.entry.client.request(method, params, self.timeout()).await
    }

    /// Path rendered relative to the project root.
    pub fn rel_path(&self) -> String {
        self.path
            .strip_prefix(&self.root)
            .unwrap_or(&self.path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// First-open settling: the rust profile treats the first
/// `publishDiagnostics` as the readiness signal, everything else just waits
/// out the configured delay.
async fn settle(entry: &ServerEntry, uri: &Url) {
    let profile = &entry.language.profile;
    debug!(
        language = entry.language.id,
        delay_ms = profile.open_delay.as_millis() as u64,
        "settling after first open"
    );
    if profile.wait_for_diagnostics_on_open {
        let _ = entry.diagnostics.wait_for(uri, profile.open_delay).await;
    } else {
        tokio::time::sleep(profile.open_delay).await;
    }
}
