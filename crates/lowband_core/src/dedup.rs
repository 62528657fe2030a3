//! Single-flight coalescing of identical in-flight requests.
//!
//! The first caller for a fingerprint becomes the leader and does the work;
//! everyone arriving before it resolves subscribes to its result. A ticket
//! is removed from the table before its result is published, so a later
//! arrival either joins the current flight or starts a fresh one, never
//! observes a finished ticket.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use lowband_cache::Fingerprint;
use tokio::{
    sync::watch,
    time::{Duration, timeout},
};
use tracing::debug;

struct Flight<T> {
    id: u64,
    rx: watch::Receiver<Option<T>>,
}

pub struct Deduplicator<T> {
    inflight: DashMap<Fingerprint, Flight<T>>,
    next_id: AtomicU64,
}

pub enum Role<'a, T: Clone> {
    Leader(LeaderTicket<'a, T>),
    Follower(FollowerTicket<T>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for the leader")]
    Timeout,
    #[error("leader went away without a result")]
    LeaderGone,
}

impl<T: Clone> Default for Deduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deduplicator<T> {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join the flight for `key`, or start one.
    pub fn acquire(&self, key: Fingerprint) -> Role<'_, T> {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(flight) => {
                debug!(target: "lowband::dedup", key = %key.short(), "Joining in-flight request");
                Role::Follower(FollowerTicket {
                    rx: flight.get().rx.clone(),
                })
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slot.insert(Flight { id, rx });
                Role::Leader(LeaderTicket {
                    dedup: self,
                    key,
                    id,
                    tx: Some(tx),
                })
            }
        }
    }

    /// Number of flights currently open.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    fn close(&self, key: &Fingerprint, id: u64) {
        self.inflight.remove_if(key, |_, flight| flight.id == id);
    }
}

/// Held by the caller doing the work. Dropping it unresolved (for instance
/// when the caller's future is cancelled) releases every follower with
/// [`WaitError::LeaderGone`].
pub struct LeaderTicket<'a, T: Clone> {
    dedup: &'a Deduplicator<T>,
    key: Fingerprint,
    id: u64,
    tx: Option<watch::Sender<Option<T>>>,
}

impl<T: Clone> LeaderTicket<'_, T> {
    pub fn resolve(mut self, value: T) {
        self.dedup.close(&self.key, self.id);
        if let Some(tx) = self.tx.take() {
            let waiting = tx.receiver_count().saturating_sub(1);
            // no followers is fine
            let _ = tx.send(Some(value));
            if waiting > 0 {
                debug!(
                    target: "lowband::dedup",
                    key = %self.key.short(),
                    followers = waiting,
                    "Shared result with followers"
                );
            }
        }
    }
}

impl<T: Clone> Drop for LeaderTicket<'_, T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            debug!(target: "lowband::dedup", key = %self.key.short(), "Leader dropped before resolving");
            self.dedup.close(&self.key, self.id);
        }
    }
}

pub struct FollowerTicket<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> FollowerTicket<T> {
    pub async fn wait(mut self, limit: Duration) -> Result<T, WaitError> {
        match timeout(limit, self.rx.wait_for(Option::is_some)).await {
            Err(_) => Err(WaitError::Timeout),
            Ok(Err(_)) => Err(WaitError::LeaderGone),
            Ok(Ok(value)) => (*value).clone().ok_or(WaitError::LeaderGone),
        }
    }
}
