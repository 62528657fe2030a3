//! Per-session sticky assignments.

use std::sync::{Arc, PoisonError};

use tokio::time::{Duration, Instant};

use super::Rotator;

#[derive(Debug, Clone)]
pub(crate) struct Assignment {
    pub(crate) index: usize,
    pub(crate) assigned_at: Instant,
    pub(crate) bytes_transferred: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) current: Option<Assignment>,
}

/// Read-only view of a session's current binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub proxy_id: String,
    pub assigned_for: Duration,
    pub bytes_transferred: u64,
}

impl Rotator {
    /// Add bytes moved through the session's current proxy.
    ///
    /// Bytes are dropped if the session has rotated away from `proxy_id`
    /// in the meantime.
    pub fn record_transfer(&self, session_id: &str, proxy_id: &str, bytes: u64) {
        let Some(slot) = self.sessions.get(session_id).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = state.current.as_mut() {
            if self.pool[current.index].id == proxy_id {
                current.bytes_transferred = current.bytes_transferred.saturating_add(bytes);
            }
        }
    }

    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        let slot = self.sessions.get(session_id).map(|s| Arc::clone(s.value()))?;
        let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let current = state.current.as_ref()?;
        Some(SessionInfo {
            proxy_id: self.pool[current.index].id.clone(),
            assigned_for: Instant::now().saturating_duration_since(current.assigned_at),
            bytes_transferred: current.bytes_transferred,
        })
    }

    /// Forget a session; its next request gets a fresh assignment.
    pub fn end_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use crate::Rotator;
    use lowband_http::ProxyEndpoint;
    use tokio::time::Duration;

    fn rotator() -> Rotator {
        Rotator::new(
            vec![
                ProxyEndpoint::new("p1", "http://10.0.0.1:3128"),
                ProxyEndpoint::new("p2", "http://10.0.0.2:3128"),
            ],
            Duration::from_secs(600),
            3,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn transfer_is_tracked_on_current_proxy_only() {
        let r = rotator();
        let proxy = r.select("s1").unwrap();
        r.record_transfer("s1", &proxy.id, 100);
        r.record_transfer("s1", "someone-else", 50);
        r.record_transfer("unknown", &proxy.id, 50);

        let info = r.session("s1").expect("session exists");
        assert_eq!(info.proxy_id, proxy.id);
        assert_eq!(info.bytes_transferred, 100);
    }

    #[test]
    fn ended_session_is_forgotten() {
        let r = rotator();
        r.select("s1").unwrap();
        r.end_session("s1");
        assert!(r.session("s1").is_none());
    }
}
