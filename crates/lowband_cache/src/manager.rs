use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use lowband_config::CacheConfig;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::{
    entry::{CacheEntry, Validator},
    key::{Fingerprint, KeyRules},
    policy::CachePolicy,
    store::{CacheError, CacheStore, MemoryCacheStore},
};

/// Outcome of a revalidation attempt.
#[derive(Debug, Clone)]
pub enum Revalidation {
    /// Validator matched; TTL restarted, entry returned as stored.
    Fresh(CacheEntry),
    /// Validator mismatch or entry gone.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Front door of the response cache. Backend failures never escape.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    policy: CachePolicy,
    rules: KeyRules,
}

impl CacheManager {
    pub fn new(cfg: &CacheConfig) -> Self {
        Self::with_store(cfg, Arc::new(MemoryCacheStore::new(cfg.capacity_bytes())))
    }

    pub fn with_store(cfg: &CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            policy: CachePolicy::from_config(cfg),
            rules: KeyRules::from_config(cfg),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn fingerprint(&self, method: &Method, url: &Url, headers: &HeaderMap) -> Fingerprint {
        Fingerprint::compute(method, url, headers, &self.rules)
    }

    /// Fresh entry or miss. Expired entries without a validator are dropped;
    /// those with one are kept for revalidation.
    pub fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        let entry = degrade(self.store.get(key), "get")??;
        if !entry.is_expired() {
            debug!(target: "lowband::cache", key = %key.short(), "Cache hit");
            return Some(entry);
        }

        if entry.validator.is_none() {
            debug!(target: "lowband::cache", key = %key.short(), "Expired entry evicted");
            degrade(self.store.remove(key), "remove");
        } else {
            debug!(target: "lowband::cache", key = %key.short(), "Expired entry kept for revalidation");
        }
        None
    }

    /// Insert or replace an entry. Oversized bodies and zero-TTL entries
    /// without a validator are not stored.
    pub fn put(
        &self,
        key: &Fingerprint,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        ttl: Duration,
    ) {
        let validator = Validator::from_headers(&headers);
        if ttl.is_zero() && validator.is_none() {
            return;
        }

        let entry = CacheEntry {
            fingerprint: key.clone(),
            status,
            headers,
            body,
            stored_at: Instant::now(),
            ttl,
            validator,
        };
        if !self.policy.fits(entry.size()) {
            debug!(
                target: "lowband::cache",
                key = %key.short(),
                size = entry.size(),
                "Entry exceeds max object size; not stored"
            );
            return;
        }

        debug!(
            target: "lowband::cache",
            key = %key.short(),
            size = entry.size(),
            ttl_secs = ttl.as_secs(),
            "Storing response"
        );
        degrade(self.store.insert(entry), "insert");
    }

    /// Validator of any stored entry, expired or not.
    pub fn validator(&self, key: &Fingerprint) -> Option<Validator> {
        degrade(self.store.get(key), "get")??.validator
    }

    /// Drop whatever is stored under `key`; used when a fresh response
    /// supersedes it.
    pub fn invalidate(&self, key: &Fingerprint) {
        if let Some(Some(_)) = degrade(self.store.remove(key), "remove") {
            debug!(target: "lowband::cache", key = %key.short(), "Superseded entry dropped");
        }
    }

    /// Confirm a stored entry against the validator the origin vouched for.
    ///
    /// `refreshed_ttl` replaces the stored TTL when the 304 carried one.
    pub fn revalidate(
        &self,
        key: &Fingerprint,
        validator: &Validator,
        refreshed_ttl: Option<Duration>,
    ) -> Revalidation {
        let Some(Some(mut entry)) = degrade(self.store.get(key), "get") else {
            return Revalidation::Stale;
        };

        let matched = entry
            .validator
            .as_ref()
            .map(|stored| stored.matches(validator))
            .unwrap_or(false);

        if !matched {
            debug!(target: "lowband::cache", key = %key.short(), "Validator mismatch; dropping entry");
            degrade(self.store.remove(key), "remove");
            return Revalidation::Stale;
        }

        let now = Instant::now();
        match degrade(self.store.touch(key, now, refreshed_ttl), "touch") {
            Some(true) => {
                debug!(target: "lowband::cache", key = %key.short(), "Entry revalidated");
                entry.stored_at = now;
                if let Some(ttl) = refreshed_ttl {
                    entry.ttl = ttl;
                }
                Revalidation::Fresh(entry)
            }
            _ => Revalidation::Stale,
        }
    }

    pub fn stats(&self) -> CacheStats {
        degrade(self.store.usage(), "usage")
            .map(|(entries, bytes)| CacheStats { entries, bytes })
            .unwrap_or_default()
    }
}

fn degrade<T>(result: Result<T, CacheError>, op: &'static str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(target: "lowband::cache", op, error = %e, "Cache backend error; treating as miss");
            None
        }
    }
}
