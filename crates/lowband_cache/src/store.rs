use std::sync::Mutex;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::entry::CacheEntry;
use crate::key::Fingerprint;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage backend behind the cache manager.
///
/// Every error is downgraded to a miss by the manager.
pub trait CacheStore: Send + Sync {
    /// Look up an entry (fresh or not) and mark it recently used.
    fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or replace; may evict other entries.
    fn insert(&self, entry: CacheEntry) -> Result<(), CacheError>;

    fn remove(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

    /// Restart the TTL clock of an entry, optionally with a new TTL.
    /// Returns false when it is gone.
    fn touch(&self, key: &Fingerprint, now: Instant, ttl: Option<Duration>)
    -> Result<bool, CacheError>;

    /// `(entries, bytes)` currently held.
    fn usage(&self) -> Result<(usize, u64), CacheError>;
}

#[derive(Debug)]
struct Inner {
    lru: LruCache<Fingerprint, CacheEntry>,
    bytes_in_use: u64,
}

/// In-memory LRU bounded by a byte budget.
#[derive(Debug)]
pub struct MemoryCacheStore {
    inner: Mutex<Inner>,
    capacity_bytes: u64,
}

impl MemoryCacheStore {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            capacity_bytes,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, CacheError> {
        self.inner
            .lock()
            .map_err(|_| CacheError::Unavailable("memory store lock poisoned".into()))
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lock()?.lru.get(key).cloned())
    }

    fn insert(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let size = entry.size();
        if size > self.capacity_bytes {
            debug!(
                target: "lowband::cache",
                key = %entry.fingerprint.short(),
                size,
                "Entry larger than the whole budget; not stored"
            );
            return Ok(());
        }

        let mut inner = self.lock()?;
        if let Some(old) = inner.lru.put(entry.fingerprint.clone(), entry) {
            inner.bytes_in_use = inner.bytes_in_use.saturating_sub(old.size());
        }
        inner.bytes_in_use += size;

        while inner.bytes_in_use > self.capacity_bytes {
            let Some((evicted_key, evicted)) = inner.lru.pop_lru() else {
                break;
            };
            inner.bytes_in_use = inner.bytes_in_use.saturating_sub(evicted.size());
            debug!(
                target: "lowband::cache",
                key = %evicted_key.short(),
                freed = evicted.size(),
                "Evicted least recently used entry"
            );
        }
        Ok(())
    }

    fn remove(&self, key: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let mut inner = self.lock()?;
        let removed = inner.lru.pop(key);
        if let Some(entry) = &removed {
            inner.bytes_in_use = inner.bytes_in_use.saturating_sub(entry.size());
        }
        Ok(removed)
    }

    fn touch(
        &self,
        key: &Fingerprint,
        now: Instant,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut inner = self.lock()?;
        match inner.lru.get_mut(key) {
            Some(entry) => {
                entry.stored_at = now;
                if let Some(ttl) = ttl {
                    entry.ttl = ttl;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn usage(&self) -> Result<(usize, u64), CacheError> {
        let inner = self.lock()?;
        Ok((inner.lru.len(), inner.bytes_in_use))
    }
}
