//! evex store: involved-object metadata cache.
//!
//! A read-through cache in front of any [`MetadataSource`]. Entries live in a
//! bounded LRU map; concurrent misses on one key share a single backend read.
//! Not-found answers are memoized like positive ones, so a burst of events for
//! a deleted object costs one read until the entry is evicted.

#![forbid(unsafe_code)]

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use evex_core::{CacheKey, ExporterMetrics, MetadataError, MetadataSource, ObjectMetadata, ObjectRef};
use lru::LruCache;
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

type Lookup = Result<ObjectMetadata, MetadataError>;

struct State {
    /// `None` values record a confirmed not-found. No map at capacity zero.
    entries: Option<LruCache<CacheKey, Option<ObjectMetadata>>>,
    evicted: u64,
    inflight: FxHashMap<CacheKey, Arc<OnceCell<Lookup>>>,
}

impl State {
    fn memo(&mut self, key: &CacheKey) -> Option<Option<ObjectMetadata>> {
        self.entries.as_mut()?.get(key).cloned()
    }

    fn remember(&mut self, key: CacheKey, memo: Option<ObjectMetadata>) {
        let Some(entries) = self.entries.as_mut() else { return };
        if let Some((old, _)) = entries.push(key.clone(), memo) {
            if old != key {
                self.evicted += 1;
                trace!(key = %old, "metadata cache evicted");
            }
        }
    }
}

/// Memoizing, coalescing metadata resolver.
pub struct ObjectMetadataCache {
    source: Arc<dyn MetadataSource>,
    state: Mutex<State>,
    metrics: Arc<ExporterMetrics>,
}

/// Held by the caller that opened an in-flight slot. If that caller is dropped
/// before the read completes, the slot is released so later callers start over.
struct InflightSlot<'a> {
    cache: &'a ObjectMetadataCache,
    key: &'a CacheKey,
    cell: &'a Arc<OnceCell<Lookup>>,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        if self.cell.initialized() {
            return;
        }
        let mut st = self.cache.lock();
        if st.inflight.get(self.key).is_some_and(|cur| Arc::ptr_eq(cur, self.cell)) {
            st.inflight.remove(self.key);
        }
    }
}

fn from_memo(key: &CacheKey, memo: Option<ObjectMetadata>) -> Lookup {
    memo.ok_or_else(|| MetadataError::NotFound(key.to_string()))
}

impl ObjectMetadataCache {
    pub fn new(source: Arc<dyn MetadataSource>, capacity: usize, metrics: Arc<ExporterMetrics>) -> Self {
        let entries = NonZeroUsize::new(capacity).map(LruCache::new);
        Self {
            source,
            state: Mutex::new(State { entries, evicted: 0, inflight: FxHashMap::default() }),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize { self.lock().entries.as_ref().map_or(0, LruCache::len) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn capacity(&self) -> usize { self.lock().entries.as_ref().map_or(0, |e| e.cap().get()) }
    pub fn evicted(&self) -> u64 { self.lock().evicted }
    /// Keys with a backend read currently outstanding.
    pub fn inflight(&self) -> usize { self.lock().inflight.len() }

    /// Resolve metadata for `reference`, serving from memory when possible.
    pub async fn get_object_metadata(&self, reference: &ObjectRef) -> Lookup {
        let key = reference.cache_key();
        let (cell, leader) = {
            let mut st = self.lock();
            if let Some(memo) = st.memo(&key) {
                drop(st);
                self.metrics.cache_hit();
                trace!(key = %key, "metadata cache hit");
                return from_memo(&key, memo);
            }
            match st.inflight.get(&key) {
                Some(cell) => (Arc::clone(cell), false),
                None => {
                    let cell = Arc::new(OnceCell::new());
                    st.inflight.insert(key.clone(), Arc::clone(&cell));
                    (cell, true)
                }
            }
        };
        let slot = leader.then(|| InflightSlot { cache: self, key: &key, cell: &cell });

        // Whoever runs the read counts the miss; everyone else shared it.
        let mut ran_read = false;
        let (source, metrics, key_ref) = (&self.source, &self.metrics, &key);
        let result = cell
            .get_or_init(|| {
                ran_read = true;
                async move {
                    metrics.cache_miss();
                    debug!(key = %key_ref, "metadata cache miss; reading from control plane");
                    source.object_metadata(reference).await
                }
            })
            .await
            .clone();
        drop(slot);
        if !ran_read {
            self.metrics.cache_hit();
            trace!(key = %key, "joined in-flight metadata read");
        }

        let mut st = self.lock();
        let owns_slot = st.inflight.get(&key).is_some_and(|cur| Arc::ptr_eq(cur, &cell));
        if owns_slot {
            st.inflight.remove(&key);
            match &result {
                Ok(meta) => st.remember(key, Some(meta.clone())),
                Err(e) if e.is_not_found() => st.remember(key, None),
                Err(_) => {}
            }
        }
        result
    }
}

#[async_trait::async_trait]
impl MetadataSource for ObjectMetadataCache {
    async fn object_metadata(&self, reference: &ObjectRef) -> Result<ObjectMetadata, MetadataError> {
        self.get_object_metadata(reference).await
    }
}
