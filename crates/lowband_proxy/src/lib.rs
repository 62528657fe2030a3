use std::sync::{Arc, Mutex, PoisonError, atomic::AtomicUsize};

use dashmap::DashMap;
use lowband_config::ProxyConfig;
use lowband_http::ProxyEndpoint;
use tokio::time::{Duration, Instant};
use tracing::{info, instrument};

mod health;
mod session;

use health::{HealthPolicy, ProxyHealth};
use session::{Assignment, SessionState};

pub use session::SessionInfo;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RotateError {
    #[error("no healthy proxy available for session '{session}'")]
    NoProxyAvailable { session: String },
}

/// =======================================================
/// ROTATOR STATE
/// =======================================================
///
/// Everything that must survive between requests and be safe under
/// concurrency: the round-robin cursor, per-proxy health records and
/// per-session sticky assignments. Shared as `Arc<Rotator>`.
pub struct Rotator {
    pool: Vec<ProxyEndpoint>,
    stickiness: Duration,
    policy: HealthPolicy,

    /// Round-robin cursor over `pool`
    cursor: AtomicUsize,

    /// Health records per proxy id; only touched through the Rotator API
    health: DashMap<String, ProxyHealth>,

    /// Sticky assignment per logical session
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
}

impl Rotator {
    pub fn new(
        pool: Vec<ProxyEndpoint>,
        stickiness: Duration,
        fail_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            pool,
            stickiness,
            policy: HealthPolicy {
                fail_threshold: fail_threshold.max(1),
                cooldown,
            },
            cursor: AtomicUsize::new(0),
            health: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &ProxyConfig) -> Self {
        let pool = cfg
            .pool()
            .iter()
            .map(|p| ProxyEndpoint::new(p.id.clone(), p.url.clone()))
            .collect();
        Self::new(
            pool,
            Duration::from_secs(cfg.stickiness_secs()),
            cfg.fail_threshold(),
            Duration::from_secs(cfg.cooldown_secs()),
        )
    }

    pub fn pool(&self) -> &[ProxyEndpoint] {
        &self.pool
    }

    /// Egress proxy for `session_id`.
    ///
    /// Keeps the current assignment while the stickiness window is open and
    /// the proxy is healthy; otherwise moves to the next healthy proxy in
    /// round-robin order. Requests racing on the same session serialize on
    /// the session lock, so the later one reuses the fresh assignment.
    #[instrument(skip(self), level = "debug")]
    pub fn select(&self, session_id: &str) -> Result<ProxyEndpoint, RotateError> {
        let slot = self.session_slot(session_id);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some(current) = &state.current {
            let within_window =
                now.saturating_duration_since(current.assigned_at) < self.stickiness;
            if within_window && self.is_healthy_at(&self.pool[current.index].id, now) {
                return Ok(self.pool[current.index].clone());
            }
        }

        let previous = state.current.as_ref().map(|a| a.index);
        let Some(index) = self.next_healthy(previous, now) else {
            state.current = None;
            return Err(RotateError::NoProxyAvailable {
                session: session_id.to_string(),
            });
        };

        if previous != Some(index) {
            info!(
                target: "lowband::proxy",
                session = %session_id,
                from = previous.map(|i| self.pool[i].id.as_str()).unwrap_or("-"),
                to = %self.pool[index].id,
                "Assigned egress proxy"
            );
        }
        state.current = Some(Assignment {
            index,
            assigned_at: now,
            bytes_transferred: 0,
        });
        Ok(self.pool[index].clone())
    }

    /// Next healthy proxy in round-robin order, avoiding `previous` when
    /// another healthy one exists.
    fn next_healthy(&self, previous: Option<usize>, now: Instant) -> Option<usize> {
        let n = self.pool.len();
        if n == 0 {
            return None;
        }

        let start = self
            .cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % n;
        let mut fallback = None;
        for i in 0..n {
            let index = (start + i) % n;
            if !self.is_healthy_at(&self.pool[index].id, now) {
                continue;
            }
            if Some(index) == previous {
                fallback = Some(index);
                continue;
            }
            return Some(index);
        }
        fallback
    }

    fn session_slot(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        if let Some(slot) = self.sessions.get(session_id) {
            return Arc::clone(&slot);
        }
        Arc::clone(
            &self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionState::default()))),
        )
    }
}
