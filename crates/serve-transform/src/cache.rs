//! Keyed transform cache with single-flight production.
//!
//! Keys carry `(path, mtime, content hash, kind)`: the content hash breaks
//! ties when the filesystem's mtime resolution is coarser than an editor's
//! save cadence. Entries are byte-counted against a budget and held in an
//! LRU; eviction runs at insertion time, before the new entry is admitted.
//!
//! Single-flight: for any key, at most one producer runs at a time.
//! Concurrent requesters for the same key await the in-flight producer and
//! share its result. A failed production is never cached; waiters retry
//! sequentially, so a transient failure cannot fan out into a stampede.

use crate::error::TransformError;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

/// Default byte budget (`B`): 64 MiB.
pub const DEFAULT_BYTE_BUDGET: usize = 64 * 1024 * 1024;

/// Default entry-count ceiling (`C_max`).
pub const DEFAULT_MAX_ENTRIES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Ts,
    Css,
}

impl TransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Ts => "ts",
            TransformKind::Css => "css",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransformKey {
    pub path: PathBuf,
    pub mtime_nanos: u128,
    pub content_hash: u64,
    pub kind: TransformKind,
}

impl TransformKey {
    /// Build a key for file contents already read into memory. The caller
    /// supplies the mtime it observed; hashing covers the exact bytes the
    /// producer will see.
    pub fn from_contents(
        path: &Path,
        kind: TransformKind,
        mtime: Option<SystemTime>,
        contents: &[u8],
    ) -> Self {
        let mtime_nanos = mtime
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            mtime_nanos,
            content_hash: seahash::hash(contents),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformEntry {
    pub bytes: Vec<u8>,
    pub source_map: Option<String>,
    pub content_type: &'static str,
    pub produced_at: Instant,
}

impl TransformEntry {
    pub fn new(bytes: Vec<u8>, source_map: Option<String>, content_type: &'static str) -> Self {
        Self {
            bytes,
            source_map,
            content_type,
            produced_at: Instant::now(),
        }
    }

    /// Bytes charged against the cache budget.
    pub fn size(&self) -> usize {
        self.bytes.len() + self.source_map.as_ref().map_or(0, |m| m.len())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

type InflightCell = Arc<OnceCell<Arc<TransformEntry>>>;

struct CacheState {
    lru: LruCache<TransformKey, Arc<TransformEntry>>,
    bytes: usize,
    inflight: HashMap<TransformKey, InflightCell>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct TransformCache {
    state: Mutex<CacheState>,
    byte_budget: usize,
}

impl Default for TransformCache {
    fn default() -> Self {
        Self::new(DEFAULT_BYTE_BUDGET, DEFAULT_MAX_ENTRIES)
    }
}

impl TransformCache {
    pub fn new(byte_budget: usize, max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                lru: LruCache::new(cap),
                bytes: 0,
                inflight: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            byte_budget,
        }
    }

    pub fn get(&self, key: &TransformKey) -> Option<Arc<TransformEntry>> {
        let mut state = self.lock();
        let found = state.lru.get(key).cloned();
        match found {
            Some(entry) => {
                state.hits += 1;
                Some(entry)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Fetch or produce the entry for `key`. See the module docs for the
    /// single-flight contract. The producer future typically wraps a
    /// `spawn_blocking` transpile.
    pub async fn produce<F, Fut>(
        &self,
        key: TransformKey,
        producer: F,
    ) -> Result<Arc<TransformEntry>, TransformError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TransformEntry, TransformError>>,
    {
        let cell = {
            let mut state = self.lock();
            let found = state.lru.get(&key).cloned();
            if let Some(entry) = found {
                state.hits += 1;
                return Ok(entry);
            }
            state.misses += 1;
            state.inflight.entry(key.clone()).or_default().clone()
        };

        let produced = cell
            .get_or_try_init(|| async {
                trace!(
                    target: "transform.cache",
                    path = %key.path.display(),
                    kind = key.kind.as_str(),
                    "producer_start"
                );
                producer().await.map(Arc::new)
            })
            .await?
            .clone();

        let mut state = self.lock();
        state.inflight.remove(&key);
        if !state.lru.contains(&key) {
            self.admit(&mut state, key, produced.clone());
        }
        Ok(produced)
    }

    /// Drop every cached entry and any in-flight cell for `path`, regardless
    /// of kind or key vintage.
    pub fn invalidate(&self, path: &Path) {
        let mut state = self.lock();
        let stale: Vec<TransformKey> = state
            .lru
            .iter()
            .filter(|(k, _)| k.path == path)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(entry) = state.lru.pop(key) {
                state.bytes -= entry.size();
            }
        }
        state.inflight.retain(|k, _| k.path != path);
        if !stale.is_empty() {
            debug!(
                target: "transform.cache",
                path = %path.display(),
                dropped = stale.len(),
                "cache_invalidated"
            );
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            entries: state.lru.len(),
            bytes: state.bytes,
        }
    }

    /// Insert with eviction-before-admission. An entry larger than the whole
    /// budget is served but never cached.
    fn admit(&self, state: &mut CacheState, key: TransformKey, entry: Arc<TransformEntry>) {
        let size = entry.size();
        if size > self.byte_budget {
            debug!(
                target: "transform.cache",
                path = %key.path.display(),
                size,
                budget = self.byte_budget,
                "entry_exceeds_budget_uncached"
            );
            return;
        }
        while state.bytes + size > self.byte_budget {
            match state.lru.pop_lru() {
                Some((_, evicted)) => {
                    state.bytes -= evicted.size();
                    state.evictions += 1;
                }
                None => break,
            }
        }
        if state.lru.len() == state.lru.cap().get() {
            if let Some((_, evicted)) = state.lru.pop_lru() {
                state.bytes -= evicted.size();
                state.evictions += 1;
            }
        }
        state.bytes += size;
        state.lru.put(key, entry);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
