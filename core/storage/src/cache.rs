use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

/// Byte-budgeted LRU cache of unsealed payloads.
///
/// Keyed by the logical item key. Entries are evicted from the cold end
/// until the byte budget is satisfied; a payload larger than the whole
/// budget is never cached.
pub struct PayloadCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: LruCache<String, Arc<Vec<u8>>>,
    used_bytes: usize,
    budget_bytes: usize,
    hits: u64,
    misses: u64,
}

impl PayloadCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                // Budget is enforced in bytes; the entry cap only bounds
                // pathological numbers of tiny items.
                entries: LruCache::new(NonZeroUsize::new(100_000).unwrap()),
                used_bytes: 0,
                budget_bytes,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key).cloned() {
            Some(v) => {
                inner.hits += 1;
                Some(v)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: String, payload: Arc<Vec<u8>>) {
        let size = payload.len();
        let mut inner = self.inner.lock();
        if size > inner.budget_bytes {
            return;
        }

        if let Some(old) = inner.entries.pop(&key) {
            inner.used_bytes -= old.len();
        }

        while inner.used_bytes + size > inner.budget_bytes {
            match inner.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.used_bytes -= evicted.len();
                    trace!(key = %evicted_key, "evicted cached payload");
                }
                None => break,
            }
        }

        inner.used_bytes += size;
        inner.entries.put(key, payload);
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(key) {
            inner.used_bytes -= old.len();
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.used_bytes = 0;
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    pub fn hit_rate(&self) -> f64 {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        if total == 0 {
            0.0
        } else {
            inner.hits as f64 / total as f64
        }
    }
}
