//! Per-session and per-proxy byte counters.
//!
//! Counters are plain atomics behind sharded maps, so recording never
//! waits on another session and never fails.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    bytes_saved: AtomicU64,
    requests: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
    blocked: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn totals(&self) -> Totals {
        Totals {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Bytes the caller received without them crossing the wire.
    pub bytes_saved: u64,
    pub requests: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
    pub blocked: u64,
    pub failures: u64,
}

impl Totals {
    fn add(&mut self, other: &Totals) {
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.bytes_saved += other.bytes_saved;
        self.requests += other.requests;
        self.cache_hits += other.cache_hits;
        self.deduplicated += other.deduplicated;
        self.blocked += other.blocked;
        self.failures += other.failures;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BandwidthSnapshot {
    pub total: Totals,
    pub sessions: BTreeMap<String, Totals>,
    pub proxies: BTreeMap<String, Totals>,
}

/// What a finished request counts as, beyond its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tally {
    Served,
    CacheHit,
    Deduplicated,
    Blocked,
    Failed,
}

#[derive(Debug, Default)]
pub struct BandwidthAccountant {
    sessions: DashMap<String, Counters>,
    proxies: DashMap<String, Counters>,
}

impl BandwidthAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire bytes of one upstream exchange.
    pub fn record(&self, session_id: &str, proxy_id: Option<&str>, bytes_in: u64, bytes_out: u64) {
        let add = |c: &Counters| {
            c.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
            c.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        };
        with_counters(&self.sessions, session_id, add);
        if let Some(proxy_id) = proxy_id {
            with_counters(&self.proxies, proxy_id, add);
        }
    }

    pub fn record_saved(&self, session_id: &str, bytes: u64) {
        with_counters(&self.sessions, session_id, |c| {
            c.bytes_saved.fetch_add(bytes, Ordering::Relaxed);
        });
    }

    pub(crate) fn record_request(&self, session_id: &str, tally: Tally) {
        with_counters(&self.sessions, session_id, |c| {
            c.requests.fetch_add(1, Ordering::Relaxed);
            let counter = match tally {
                Tally::Served => return,
                Tally::CacheHit => &c.cache_hits,
                Tally::Deduplicated => &c.deduplicated,
                Tally::Blocked => &c.blocked,
                Tally::Failed => &c.failures,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Point-in-time copy of every counter. Totals cover sessions only;
    /// proxy rows are the same traffic broken down by egress.
    pub fn snapshot(&self) -> BandwidthSnapshot {
        let mut snapshot = BandwidthSnapshot::default();
        for row in self.sessions.iter() {
            let totals = row.value().totals();
            snapshot.total.add(&totals);
            snapshot.sessions.insert(row.key().clone(), totals);
        }
        for row in self.proxies.iter() {
            snapshot.proxies.insert(row.key().clone(), row.value().totals());
        }
        snapshot
    }
}

fn with_counters(map: &DashMap<String, Counters>, id: &str, f: impl FnOnce(&Counters)) {
    if let Some(counters) = map.get(id) {
        f(&counters);
        return;
    }
    f(&map.entry(id.to_string()).or_default());
}
