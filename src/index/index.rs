//! In-memory symbol index: four structures over per-file symbol arenas.
//!
//! Readers query concurrently against the sharded maps; per-file updates
//! replace a file's records and every derived entry atomically with respect
//! to that file. Observers subscribe to the event bus for index changes.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use lsp_types::{Position, Url};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::index::model::{FileSymbols, SymbolHit, SymbolKind, SymbolNodeId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum IndexEvent {
    FileIndexed {
        uri: Url,
        symbols: usize,
        from_cache: bool,
    },
    FileRemoved {
        uri: Url,
    },
    IndexError {
        uri: Url,
        message: String,
    },
    ExternalLibrariesIndexed {
        libraries: usize,
        symbols: usize,
    },
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub files: usize,
    pub symbols: usize,
    pub external_files: usize,
    pub by_kind: Vec<(SymbolKind, usize)>,
    pub last_updated: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct SymbolQuery {
    /// Exact name; falls back to case-insensitive substring when no exact
    /// match exists.
    pub name: Option<String>,
    pub kinds: Vec<SymbolKind>,
    pub container: Option<String>,
    pub file: Option<Url>,
    pub include_children: bool,
    pub include_external: bool,
    pub only_external: bool,
    pub source_library: Option<String>,
}

impl Default for SymbolQuery {
    fn default() -> Self {
        Self {
            name: None,
            kinds: Vec::new(),
            container: None,
            file: None,
            include_children: true,
            include_external: false,
            only_external: false,
            source_library: None,
        }
    }
}

type EntryRef = (Url, SymbolNodeId);

pub struct SymbolIndex {
    files: DashMap<Url, Arc<FileSymbols>>,
    by_name: DashMap<String, Vec<EntryRef>>,
    by_kind: DashMap<SymbolKind, Vec<EntryRef>>,
    by_container: DashMap<String, Vec<EntryRef>>,
    /// Serializes whole-file updates; readers stay lock-free on the maps.
    update_lock: Mutex<()>,
    events: broadcast::Sender<IndexEvent>,
    last_updated: Mutex<Option<SystemTime>>,
}

impl Default for SymbolIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolIndex {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            files: DashMap::new(),
            by_name: DashMap::new(),
            by_kind: DashMap::new(),
            by_container: DashMap::new(),
            update_lock: Mutex::new(()),
            events,
            last_updated: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: IndexEvent) {
        let _ = self.events.send(event);
    }

    pub fn file(&self, uri: &Url) -> Option<Arc<FileSymbols>> {
        self.files.get(uri).map(|f| f.clone())
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.files.contains_key(uri)
    }

    /// Replace all records for the file, updating every derived structure.
    pub fn insert_file(&self, record: FileSymbols, from_cache: bool) {
        let record = Arc::new(record);
        let uri = record.uri.clone();
        let _update = self.update_lock.lock();
        self.strip_derived(&uri);

        for (id, node) in record.nodes.iter().enumerate() {
            let entry = (uri.clone(), id as SymbolNodeId);
            self.by_name
                .entry(node.name.clone())
                .or_default()
                .push(entry.clone());
            self.by_kind.entry(node.kind).or_default().push(entry.clone());
            if let Some(container) = &node.container {
                self.by_container
                    .entry(container.clone())
                    .or_default()
                    .push(entry);
            }
        }

        let symbols = record.symbol_count();
        self.files.insert(uri.clone(), record);
        *self.last_updated.lock() = Some(SystemTime::now());
        debug!(uri = %uri, symbols, from_cache, "indexed file");
        self.emit(IndexEvent::FileIndexed {
            uri,
            symbols,
            from_cache,
        });
    }

    /// Remove the file and every derived entry.
    pub fn remove_file(&self, uri: &Url) -> bool {
        let _update = self.update_lock.lock();
        let removed = self.files.remove(uri).is_some();
        if removed {
            self.strip_derived(uri);
            *self.last_updated.lock() = Some(SystemTime::now());
            self.emit(IndexEvent::FileRemoved { uri: uri.clone() });
        }
        removed
    }

    fn strip_derived(&self, uri: &Url) {
        for map in [&self.by_name, &self.by_container] {
            map.retain(|_, entries| {
                entries.retain(|(entry_uri, _)| entry_uri != uri);
                !entries.is_empty()
            });
        }
        self.by_kind.retain(|_, entries| {
            entries.retain(|(entry_uri, _)| entry_uri != uri);
            !entries.is_empty()
        });
    }

    /// Query the index. Name matching is exact first, then case-insensitive
    /// substring; remaining filters intersect. No match is an empty list,
    /// never an error.
    pub fn query(&self, query: &SymbolQuery) -> Vec<SymbolHit> {
        let candidates: Vec<EntryRef> = match &query.name {
            Some(name) => {
                let exact = self
                    .by_name
                    .get(name)
                    .map(|entries| entries.clone())
                    .unwrap_or_default();
                if !exact.is_empty() {
                    exact
                } else {
                    let needle = name.to_lowercase();
                    let mut matched = Vec::new();
                    for entry in self.by_name.iter() {
                        if entry.key().to_lowercase().contains(&needle) {
                            matched.extend(entry.value().iter().cloned());
                        }
                    }
                    matched
                }
            }
            None => match &query.container {
                Some(container) => self
                    .by_container
                    .get(container)
                    .map(|entries| entries.clone())
                    .unwrap_or_default(),
                None if !query.kinds.is_empty() => {
                    let mut matched = Vec::new();
                    for kind in &query.kinds {
                        if let Some(entries) = self.by_kind.get(kind) {
                            matched.extend(entries.iter().cloned());
                        }
                    }
                    matched
                }
                None => {
                    let mut all = Vec::new();
                    for file in self.files.iter() {
                        for id in 0..file.value().nodes.len() {
                            all.push((file.key().clone(), id as SymbolNodeId));
                        }
                    }
                    all
                }
            },
        };

        let mut hits = Vec::new();
        for (uri, id) in candidates {
            let Some(record) = self.file(&uri) else {
                continue;
            };
            let node = record.node(id);

            if !query.kinds.is_empty() && !query.kinds.contains(&node.kind) {
                continue;
            }
            if let Some(container) = &query.container {
                if node.container.as_deref() != Some(container.as_str()) {
                    continue;
                }
            }
            if let Some(file) = &query.file {
                if &uri != file {
                    continue;
                }
            }
            if !query.include_children && node.parent.is_some() {
                continue;
            }
            if query.only_external {
                if !record.external {
                    continue;
                }
            } else if !query.include_external && record.external {
                continue;
            }
            if let Some(library) = &query.source_library {
                if record.library.as_deref() != Some(library.as_str()) {
                    continue;
                }
            }

            hits.push(SymbolHit {
                name: node.name.clone(),
                kind: node.kind,
                location: lsp_types::Location {
                    uri: uri.clone(),
                    range: node.selection_range,
                },
                container: node.container.clone(),
                detail: node.detail.clone(),
                deprecated: node.deprecated,
                external: record.external,
                library: record.library.clone(),
                is_root: node.parent.is_none(),
            });
        }

        hits.sort_by(|a, b| {
            (
                &a.name,
                a.location.uri.as_str(),
                a.location.range.start.line,
            )
                .cmp(&(
                    &b.name,
                    b.location.uri.as_str(),
                    b.location.range.start.line,
                ))
        });
        hits
    }

    /// Deepest symbol containing `position` in the given file.
    pub fn symbol_at(&self, uri: &Url, position: Position) -> Option<SymbolHit> {
        let record = self.file(uri)?;
        let id = record.symbol_at(position)?;
        let node = record.node(id);
        Some(SymbolHit {
            name: node.name.clone(),
            kind: node.kind,
            location: lsp_types::Location {
                uri: uri.clone(),
                range: node.selection_range,
            },
            container: node.container.clone(),
            detail: node.detail.clone(),
            deprecated: node.deprecated,
            external: record.external,
            library: record.library.clone(),
            is_root: node.parent.is_none(),
        })
    }

    pub fn stats(&self) -> IndexStats {
        let mut symbols = 0usize;
        let mut external_files = 0usize;
        for file in self.files.iter() {
            symbols += file.value().symbol_count();
            if file.value().external {
                external_files += 1;
            }
        }
        let mut by_kind: Vec<(SymbolKind, usize)> = self
            .by_kind
            .iter()
            .map(|entry| (*entry.key(), entry.value().len()))
            .collect();
        by_kind.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.label().cmp(b.0.label())));

        IndexStats {
            files: self.files.len(),
            symbols,
            external_files,
            by_kind,
            last_updated: *self.last_updated.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::model::{ArenaBuilder, SymbolNode};
    use lsp_types::{DocumentSymbol, Range};

    fn range(line: u32) -> Range {
        Range {
            start: Position { line, character: 0 },
            end: Position {
                line: line + 1,
                character: 0,
            },
        }
    }

    fn file(uri: &str, names: &[(&str, SymbolKind)], external: Option<&str>) -> FileSymbols {
        let nodes: Vec<SymbolNode> = names
            .iter()
            .enumerate()
            .map(|(i, (name, kind))| SymbolNode {
                name: name.to_string(),
                kind: *kind,
                range: range(i as u32),
                selection_range: range(i as u32),
                container: None,
                detail: None,
                deprecated: false,
                parent: None,
                children: Vec::new(),
            })
            .collect();
        let roots = (0..nodes.len() as u32).collect();
        FileSymbols {
            uri: Url::parse(uri).unwrap(),
            modified_at: SystemTime::now(),
            content_hash: "h".into(),
            nodes,
            roots,
            external: external.is_some(),
            library: external.map(str::to_string),
        }
    }

    #[test]
    fn exact_match_then_substring_fallback() {
        let index = SymbolIndex::new();
        index.insert_file(
            file(
                "file:///p/a.ts",
                &[
                    ("greet", SymbolKind::Function),
                    ("greetAll", SymbolKind::Function),
                ],
                None,
            ),
            false,
        );

        let exact = index.query(&SymbolQuery {
            name: Some("greet".into()),
            ..Default::default()
        });
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].name, "greet");

        let fallback = index.query(&SymbolQuery {
            name: Some("EETA".into()),
            ..Default::default()
        });
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].name, "greetAll");
    }

    #[test]
    fn kind_filter_intersects_name_filter() {
        let index = SymbolIndex::new();
        index.insert_file(
            file(
                "file:///p/a.ts",
                &[
                    ("Config", SymbolKind::Class),
                    ("Config", SymbolKind::Variable),
                ],
                None,
            ),
            false,
        );
        let hits = index.query(&SymbolQuery {
            name: Some("Config".into()),
            kinds: vec![SymbolKind::Class],
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, SymbolKind::Class);
    }

    #[test]
    fn remove_file_strips_every_derived_entry() {
        let index = SymbolIndex::new();
        let uri = Url::parse("file:///p/a.ts").unwrap();
        index.insert_file(
            file("file:///p/a.ts", &[("greet", SymbolKind::Function)], None),
            false,
        );
        assert!(index.remove_file(&uri));

        assert!(index.file(&uri).is_none());
        let hits = index.query(&SymbolQuery::default());
        assert!(hits.is_empty());
        let by_name = index.query(&SymbolQuery {
            name: Some("greet".into()),
            ..Default::default()
        });
        assert!(by_name.is_empty());
        let by_kind = index.query(&SymbolQuery {
            kinds: vec![SymbolKind::Function],
            ..Default::default()
        });
        assert!(by_kind.is_empty());
    }

    #[test]
    fn external_filtering() {
        let index = SymbolIndex::new();
        index.insert_file(
            file("file:///p/a.ts", &[("local", SymbolKind::Function)], None),
            false,
        );
        index.insert_file(
            file(
                "file:///p/node_modules/lodash/index.js",
                &[("chunk", SymbolKind::Function)],
                Some("lodash"),
            ),
            false,
        );

        // default: externals hidden
        let default = index.query(&SymbolQuery::default());
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].name, "local");

        let only = index.query(&SymbolQuery {
            only_external: true,
            ..Default::default()
        });
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].library.as_deref(), Some("lodash"));

        let by_library = index.query(&SymbolQuery {
            include_external: true,
            source_library: Some("lodash".into()),
            ..Default::default()
        });
        assert_eq!(by_library.len(), 1);
    }

    #[test]
    fn include_children_false_keeps_roots_only() {
        let index = SymbolIndex::new();
        #[allow(deprecated)]
        let nested = vec![DocumentSymbol {
            name: "Outer".into(),
            detail: None,
            kind: lsp_types::SymbolKind::CLASS,
            tags: None,
            deprecated: None,
            range: Range {
                start: Position {
                    line: 0,
                    character: 0,
                },
                end: Position {
                    line: 9,
                    character: 0,
                },
            },
            selection_range: range(0),
            children: Some(vec![DocumentSymbol {
                name: "inner".into(),
                detail: None,
                kind: lsp_types::SymbolKind::METHOD,
                tags: None,
                deprecated: None,
                range: range(2),
                selection_range: range(2),
                children: None,
            }]),
        }];
        let (nodes, roots) = ArenaBuilder::from_nested(&nested);
        index.insert_file(
            FileSymbols {
                uri: Url::parse("file:///p/a.ts").unwrap(),
                modified_at: SystemTime::now(),
                content_hash: "h".into(),
                nodes,
                roots,
                external: false,
                library: None,
            },
            false,
        );

        let all = index.query(&SymbolQuery::default());
        assert_eq!(all.len(), 2);
        let roots_only = index.query(&SymbolQuery {
            include_children: false,
            ..Default::default()
        });
        assert_eq!(roots_only.len(), 1);
        assert_eq!(roots_only[0].name, "Outer");
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let index = SymbolIndex::new();
        let hits = index.query(&SymbolQuery {
            name: Some("anything".into()),
            ..Default::default()
        });
        assert!(hits.is_empty());
    }

    #[test]
    fn stats_track_totals() {
        let index = SymbolIndex::new();
        assert!(index.stats().last_updated.is_none());
        index.insert_file(
            file(
                "file:///p/a.ts",
                &[("a", SymbolKind::Function), ("B", SymbolKind::Class)],
                None,
            ),
            false,
        );
        let stats = index.stats();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.symbols, 2);
        assert!(stats.last_updated.is_some());
    }
}
