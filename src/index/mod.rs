//! Symbol index subsystem: in-memory query structures (C8), persistent
//! content-addressed cache (C9), and watch-driven invalidation (C10).

pub mod cache;
pub mod index;
pub mod model;
pub mod watcher;

pub use cache::{CacheRecord, SymbolCache, content_hash};
pub use index::{IndexEvent, IndexStats, SymbolIndex, SymbolQuery};
pub use model::{ArenaBuilder, FileSymbols, SymbolHit, SymbolKind, SymbolNode, SymbolNodeId};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use globset::Glob;
use lsp_types::{DocumentSymbol, SymbolInformation, Url};
use rustc_hash::FxHashSet;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::index::watcher::FileWatcher;

/// How long the reindex worker gathers events before draining a batch.
const COALESCE_WINDOW: Duration = Duration::from_millis(200);

/// Directories never walked during project indexing.
const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", ".lsmcp", "dist", "build"];

pub struct IndexOutcome {
    pub record: Arc<FileSymbols>,
    pub from_cache: bool,
}

#[derive(Debug, Default, Clone)]
pub struct IndexReport {
    pub indexed: usize,
    pub from_cache: usize,
    pub failed: usize,
    pub external_symbols: usize,
    pub external_libraries: usize,
    pub elapsed: Duration,
}

/// The index service: owns the four-structure index, per-root caches, and
/// the watcher, and drives reindexing through the broker's LSP access.
pub struct SymbolIndexService {
    broker: Weak<Broker>,
    index: SymbolIndex,
    caches: DashMap<PathBuf, Arc<SymbolCache>>,
    watcher: FileWatcher,
}

impl SymbolIndexService {
    pub fn new(broker: Weak<Broker>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak: &Weak<SymbolIndexService>| {
            tokio::spawn(reindex_worker(weak.clone(), rx));
            Self {
                broker,
                index: SymbolIndex::new(),
                caches: DashMap::new(),
                watcher: FileWatcher::new(tx),
            }
        })
    }

    pub fn index(&self) -> &SymbolIndex {
        &self.index
    }

    pub fn query(&self, query: &SymbolQuery) -> Vec<SymbolHit> {
        self.index.query(query)
    }

    pub fn stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<IndexEvent> {
        self.index.subscribe()
    }

    fn cache_for(&self, root: &Path) -> Arc<SymbolCache> {
        self.caches
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(SymbolCache::open(root)))
            .clone()
    }

    /// Index one file, serving from the cache when the content hash matches
    /// and asking the language server otherwise.
    pub async fn index_file(&self, root: &Path, file: &Path) -> Result<IndexOutcome> {
        let root = std::fs::canonicalize(root).map_err(|e| BrokerError::from_io(root, e))?;
        let path = if file.is_absolute() {
            file.to_path_buf()
        } else {
            root.join(file)
        };
        let path = std::fs::canonicalize(&path).map_err(|e| BrokerError::from_io(&path, e))?;

        let outcome = self.index_file_inner(&root, &path).await;
        if let Err(e) = &outcome {
            if let Ok(uri) = Url::from_file_path(&path) {
                self.index.emit(IndexEvent::IndexError {
                    uri,
                    message: e.to_string(),
                });
            }
        }
        outcome
    }

    async fn index_file_inner(&self, root: &Path, path: &Path) -> Result<IndexOutcome> {
        let bytes = std::fs::read(path).map_err(|e| BrokerError::from_io(path, e))?;
        let hash = content_hash(&bytes);
        let modified_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());

        let rel = relative_key(root, path);
        let library = model::external_library(root, path);
        let external = library.is_some();
        let uri = Url::from_file_path(path).map_err(|()| {
            BrokerError::InvalidArgument(format!("not an absolute path: {}", path.display()))
        })?;

        let cache = self.cache_for(root);
        if let Some(record) = cache.lookup(&rel, &hash) {
            let hydrated = SymbolCache::hydrate(record, uri.clone(), external, library);
            let record = Arc::new(hydrated);
            self.index.insert_file((*record).clone(), true);
            self.watcher.watch(path, root);
            return Ok(IndexOutcome {
                record,
                from_cache: true,
            });
        }

        let broker = self.broker.upgrade().ok_or(BrokerError::NotInitialized)?;
        let response = broker
            .with_document(root, path, |ctx| async move {
                ctx.request(
                    "textDocument/documentSymbol",
                    json!({ "textDocument": { "uri": ctx.uri } }),
                )
                .await
            })
            .await?;

        let (nodes, roots) = convert_symbol_response(&response)?;
        let record = FileSymbols {
            uri: uri.clone(),
            modified_at,
            content_hash: hash.clone(),
            nodes,
            roots,
            external,
            library,
        };

        cache.store(
            &rel,
            CacheRecord {
                content_hash: hash,
                modified_at: record.modified_at,
                nodes: record.nodes.clone(),
                roots: record.roots.clone(),
            },
        );
        self.index.insert_file(record.clone(), false);
        self.watcher.watch(path, root);

        Ok(IndexOutcome {
            record: Arc::new(record),
            from_cache: false,
        })
    }

    /// Strip a file from the index, its cache records, and the watch list.
    pub fn remove_file(&self, path: &Path) {
        let root = self.watcher.unwatch(path);
        if let Some(root) = &root {
            let rel = relative_key(root, path);
            self.cache_for(root).invalidate(&rel);
        }
        if let Ok(uri) = Url::from_file_path(path) {
            self.index.remove_file(&uri);
        }
    }

    /// React to one filesystem event: unlink removes, anything else
    /// invalidates and reindexes.
    async fn process_change(&self, path: PathBuf) {
        let Some(root) = self.watcher.root_of(&path) else {
            return;
        };
        if !path.exists() {
            debug!(file = %path.display(), "watched file removed");
            self.remove_file(&path);
            return;
        }
        let rel = relative_key(&root, &path);
        self.cache_for(&root).invalidate(&rel);
        if let Err(e) = self.index_file(&root, &path).await {
            warn!(file = %path.display(), error = %e, "reindex failed");
        }
    }

    /// Walk the project and index matching files (glob pattern, or the
    /// extension set of every registered language). The explicit trigger for
    /// background index population.
    pub async fn index_project(
        &self,
        root: &Path,
        pattern: Option<&str>,
        concurrency: usize,
    ) -> Result<IndexReport> {
        let root = std::fs::canonicalize(root).map_err(|e| BrokerError::from_io(root, e))?;
        let matcher = match pattern {
            Some(glob) => Some(
                Glob::new(glob)
                    .map_err(|e| BrokerError::InvalidArgument(format!("bad glob: {e}")))?
                    .compile_matcher(),
            ),
            None => None,
        };

        let mut files = Vec::new();
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .map(|name| SKIPPED_DIRS.contains(&name))
                        .unwrap_or(false))
            })
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "walk error");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let rel = path.strip_prefix(&root).unwrap_or(path);
            let selected = match &matcher {
                Some(matcher) => matcher.is_match(rel),
                None => crate::config::language_for_path(path).is_some(),
            };
            if selected {
                files.push(path.to_path_buf());
            }
        }

        info!(root = %root.display(), files = files.len(), "indexing project");
        let start = Instant::now();
        let mut report = IndexReport::default();
        let concurrency = concurrency.max(1);

        let mut pending = futures::stream::FuturesUnordered::new();
        let mut queue = files.into_iter();
        use futures::StreamExt;
        loop {
            while pending.len() < concurrency {
                let Some(path) = queue.next() else { break };
                let root = root.clone();
                pending.push(async move {
                    let outcome = self.index_file(&root, &path).await;
                    (path, outcome)
                });
            }
            let Some((path, outcome)) = pending.next().await else {
                break;
            };
            match outcome {
                Ok(outcome) => {
                    report.indexed += 1;
                    if outcome.from_cache {
                        report.from_cache += 1;
                    }
                    if outcome.record.external {
                        report.external_libraries += 1;
                        report.external_symbols += outcome.record.symbol_count();
                    }
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "index failed");
                    report.failed += 1;
                }
            }
        }
        report.elapsed = start.elapsed();

        if report.external_libraries > 0 {
            self.index.emit(IndexEvent::ExternalLibrariesIndexed {
                libraries: report.external_libraries,
                symbols: report.external_symbols,
            });
        }
        if let Err(e) = self.persist_all() {
            warn!(error = %e, "failed to persist symbol cache");
        }
        Ok(report)
    }

    /// Flush every dirty cache to disk.
    pub fn persist_all(&self) -> Result<()> {
        let mut first_error = None;
        for cache in self.caches.iter() {
            if let Err(e) = cache.value().persist() {
                warn!(root = %cache.key().display(), error = %e, "cache persist failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Cache key: project-relative path with forward slashes.
fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}

/// Parse a `textDocument/documentSymbol` result, which is either a nested
/// `DocumentSymbol[]`, a flat `SymbolInformation[]`, or null.
pub fn convert_symbol_response(
    response: &Value,
) -> Result<(Vec<SymbolNode>, Vec<SymbolNodeId>)> {
    if response.is_null() {
        return Ok((Vec::new(), Vec::new()));
    }
    let Some(items) = response.as_array() else {
        return Err(BrokerError::Transport(
            "documentSymbol result is not an array".into(),
        ));
    };
    if items.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    // hierarchical results carry selectionRange, flat ones carry location
    if items[0].get("selectionRange").is_some() {
        let nested: Vec<DocumentSymbol> = serde_json::from_value(response.clone())
            .map_err(|e| BrokerError::Transport(format!("malformed documentSymbol: {e}")))?;
        Ok(ArenaBuilder::from_nested(&nested))
    } else {
        let flat: Vec<SymbolInformation> = serde_json::from_value(response.clone())
            .map_err(|e| BrokerError::Transport(format!("malformed symbolInformation: {e}")))?;
        Ok(ArenaBuilder::from_flat(&flat))
    }
}

/// Drain change events in batches separated by a coalescing window.
async fn reindex_worker(
    service: Weak<SymbolIndexService>,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
) {
    loop {
        let Some(first) = rx.recv().await else { return };
        let mut batch: FxHashSet<PathBuf> = FxHashSet::default();
        batch.insert(first);

        let window = tokio::time::sleep(COALESCE_WINDOW);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                next = rx.recv() => match next {
                    Some(path) => {
                        batch.insert(path);
                    }
                    None => break,
                },
            }
        }

        let Some(service) = service.upgrade() else {
            return;
        };
        debug!(files = batch.len(), "processing watch batch");
        for path in batch {
            service.process_change(path).await;
        }
    }
}
