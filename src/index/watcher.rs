//! Filesystem watching for indexed files.
//!
//! Every indexed file is watched individually. Change events funnel into an
//! unbounded channel; the index service drains it with a short coalescing
//! window so editor save bursts become one reindex pass. Failure to stand up
//! a watcher degrades to a cold index on next restart, never an error.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub struct FileWatcher {
    watcher: Mutex<Option<RecommendedWatcher>>,
    /// Watched file → project root it was indexed under.
    watched: DashMap<PathBuf, PathBuf>,
}

impl FileWatcher {
    pub fn new(tx: UnboundedSender<PathBuf>) -> Self {
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_)
                            | EventKind::Create(_)
                            | EventKind::Remove(_)
                            | EventKind::Any
                    ) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            }
        });

        let watcher = match watcher {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "file watching unavailable; cache invalidation is restart-only");
                None
            }
        };

        Self {
            watcher: Mutex::new(watcher),
            watched: DashMap::new(),
        }
    }

    pub fn watch(&self, path: &Path, root: &Path) {
        let newly_added = self
            .watched
            .insert(path.to_path_buf(), root.to_path_buf())
            .is_none();
        if !newly_added {
            return;
        }
        if let Some(watcher) = self.watcher.lock().as_mut() {
            if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
                debug!(file = %path.display(), error = %e, "failed to watch file");
            }
        }
    }

    /// Stop watching; returns the root the file was indexed under.
    pub fn unwatch(&self, path: &Path) -> Option<PathBuf> {
        let root = self.watched.remove(path).map(|(_, root)| root);
        if root.is_some() {
            if let Some(watcher) = self.watcher.lock().as_mut() {
                let _ = watcher.unwatch(path);
            }
        }
        root
    }

    pub fn root_of(&self, path: &Path) -> Option<PathBuf> {
        self.watched.get(path).map(|entry| entry.clone())
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }
}
