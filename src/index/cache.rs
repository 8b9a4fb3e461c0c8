//! Persistent, content-addressed symbol cache.
//!
//! One cache file per project root under `<root>/.lsmcp/cache/symbols.bin`:
//! bincode-serialized, zstd-compressed, written atomically via a temp file.
//! A record is a hit iff its stored hash equals the current blake3 of the
//! file bytes; version mismatches and decode failures just mean a cold
//! cache.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::index::model::{FileSymbols, SymbolNode, SymbolNodeId};

/// Bump on any breaking change to [`CacheRecord`].
pub const CACHE_VERSION: u32 = 1;

/// Records kept in memory per root. Projects larger than this shed their
/// least-recently used entries; correctness is unaffected.
const CACHE_CAPACITY: usize = 8192;

const ZSTD_LEVEL: i32 = 3;

/// Cached symbols for one file, keyed by project-relative path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub content_hash: String,
    pub modified_at: SystemTime,
    pub nodes: Vec<SymbolNode>,
    pub roots: Vec<SymbolNodeId>,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<(String, CacheRecord)>,
}

pub struct SymbolCache {
    root: PathBuf,
    path: PathBuf,
    entries: Mutex<LruCache<String, CacheRecord>>,
    dirty: AtomicBool,
}

impl SymbolCache {
    pub fn cache_file_path(root: &Path) -> PathBuf {
        root.join(".lsmcp").join("cache").join("symbols.bin")
    }

    /// Open the cache for `root`, loading any persisted records. Decode
    /// failures start cold rather than erroring.
    pub fn open(root: &Path) -> Self {
        let path = Self::cache_file_path(root);
        let mut entries = LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap());

        match std::fs::read(&path) {
            Ok(compressed) => match decode(&compressed) {
                Ok(file) => {
                    let count = file.entries.len();
                    for (rel, record) in file.entries {
                        entries.put(rel, record);
                    }
                    debug!(root = %root.display(), records = count, "loaded symbol cache");
                }
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "discarding unreadable symbol cache");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(root = %root.display(), error = %e, "failed to read symbol cache");
            }
        }

        Self {
            root: root.to_path_buf(),
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
        }
    }

    /// A record is valid only if its hash matches the file's current hash.
    pub fn lookup(&self, rel_path: &str, current_hash: &str) -> Option<CacheRecord> {
        let mut entries = self.entries.lock();
        let record = entries.get(rel_path)?;
        if record.content_hash == current_hash {
            Some(record.clone())
        } else {
            None
        }
    }

    pub fn store(&self, rel_path: &str, record: CacheRecord) {
        self.entries.lock().put(rel_path.to_string(), record);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Drop every record for `rel_path`.
    pub fn invalidate(&self, rel_path: &str) {
        if self.entries.lock().pop(rel_path).is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().len() == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the cache to disk (temp file + rename). No-op when clean.
    pub fn persist(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let entries: Vec<(String, CacheRecord)> = {
            let cache = self.entries.lock();
            cache
                .iter()
                .map(|(rel, record)| (rel.clone(), record.clone()))
                .collect()
        };
        let file = CacheFile {
            version: CACHE_VERSION,
            entries,
        };

        let parent = self
            .path
            .parent()
            .ok_or_else(|| BrokerError::InvalidArgument("cache path has no parent".into()))?;
        std::fs::create_dir_all(parent).map_err(|e| BrokerError::from_io(parent, e))?;

        let serialized = bincode::serialize(&file)
            .map_err(|e| BrokerError::Transport(format!("cache serialization failed: {e}")))?;
        let compressed = zstd::encode_all(&serialized[..], ZSTD_LEVEL)
            .map_err(|e| BrokerError::Transport(format!("cache compression failed: {e}")))?;

        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, &compressed).map_err(|e| BrokerError::from_io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| BrokerError::from_io(&self.path, e))?;
        self.dirty.store(false, Ordering::SeqCst);
        debug!(root = %self.root.display(), records = file.entries.len(), "persisted symbol cache");
        Ok(())
    }

    /// Reassemble a full [`FileSymbols`] from a cached record.
    pub fn hydrate(
        record: CacheRecord,
        uri: lsp_types::Url,
        external: bool,
        library: Option<String>,
    ) -> FileSymbols {
        FileSymbols {
            uri,
            modified_at: record.modified_at,
            content_hash: record.content_hash,
            nodes: record.nodes,
            roots: record.roots,
            external,
            library,
        }
    }
}

fn decode(compressed: &[u8]) -> std::result::Result<CacheFile, String> {
    let serialized = zstd::decode_all(compressed).map_err(|e| format!("zstd: {e}"))?;
    let file: CacheFile =
        bincode::deserialize(&serialized).map_err(|e| format!("bincode: {e}"))?;
    if file.version != CACHE_VERSION {
        return Err(format!(
            "version mismatch: cached {}, current {}",
            file.version, CACHE_VERSION
        ));
    }
    Ok(file)
}

/// blake3 of raw bytes as lowercase hex, the cache key everywhere.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::model::SymbolKind;
    use lsp_types::{Position, Range};

    fn record(hash: &str) -> CacheRecord {
        CacheRecord {
            content_hash: hash.to_string(),
            modified_at: SystemTime::now(),
            nodes: vec![SymbolNode {
                name: "greet".into(),
                kind: SymbolKind::Function,
                range: Range {
                    start: Position {
                        line: 0,
                        character: 0,
                    },
                    end: Position {
                        line: 0,
                        character: 10,
                    },
                },
                selection_range: Range {
                    start: Position {
                        line: 0,
                        character: 0,
                    },
                    end: Position {
                        line: 0,
                        character: 5,
                    },
                },
                container: None,
                detail: None,
                deprecated: false,
                parent: None,
                children: Vec::new(),
            }],
            roots: vec![0],
        }
    }

    #[test]
    fn hit_requires_matching_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SymbolCache::open(dir.path());
        let hash = content_hash(b"export function greet() {}");
        cache.store("src/a.ts", record(&hash));

        assert!(cache.lookup("src/a.ts", &hash).is_some());
        let other_hash = content_hash(b"export function hello() {}");
        assert!(cache.lookup("src/a.ts", &other_hash).is_none());
        assert!(cache.lookup("src/missing.ts", &hash).is_none());
    }

    #[test]
    fn invalidate_removes_all_records_for_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SymbolCache::open(dir.path());
        cache.store("src/a.ts", record("h1"));
        cache.invalidate("src/a.ts");
        assert!(cache.lookup("src/a.ts", "h1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let hash = content_hash(b"body");
        {
            let cache = SymbolCache::open(dir.path());
            cache.store("src/a.ts", record(&hash));
            cache.persist().unwrap();
            assert!(!cache.is_dirty());
        }
        {
            let cache = SymbolCache::open(dir.path());
            let loaded = cache.lookup("src/a.ts", &hash).unwrap();
            assert_eq!(loaded.nodes[0].name, "greet");
        }
        assert!(SymbolCache::cache_file_path(dir.path()).exists());
    }

    #[test]
    fn corrupt_cache_file_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        let path = SymbolCache::cache_file_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"definitely not zstd").unwrap();
        let cache = SymbolCache::open(dir.path());
        assert!(cache.is_empty());
    }

    #[test]
    fn clean_cache_skips_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SymbolCache::open(dir.path());
        cache.persist().unwrap();
        assert!(!SymbolCache::cache_file_path(dir.path()).exists());
    }
}
