//! Proxy health tracking and active checks.

use std::sync::Arc;

use lowband_config::ProxyHealthConfig;
use tokio::{
    net::TcpStream,
    task::JoinHandle,
    time::{Duration, Instant, interval, timeout},
};
use tracing::{debug, warn};

use super::Rotator;

/// Health policy derived from proxy configuration.
#[derive(Debug, Clone)]
pub(crate) struct HealthPolicy {
    pub(crate) fail_threshold: u32,
    /// Zero keeps a proxy down until it is explicitly marked healthy.
    pub(crate) cooldown: Duration,
}

/// Health state tracked per proxy id.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProxyHealth {
    pub(crate) consecutive_failures: u32,
    pub(crate) down_since: Option<Instant>,
}

impl Rotator {
    /// Start background TCP checks against every proxy in the pool.
    ///
    /// Returns `None` when active checks are disabled.
    pub fn start_health_checks(self: &Arc<Self>, cfg: &ProxyHealthConfig) -> Option<JoinHandle<()>> {
        if !cfg.active() {
            return None;
        }

        let check_interval = Duration::from_secs(cfg.interval_secs().max(1));
        let check_timeout = Duration::from_secs(cfg.timeout_secs().max(1));
        let rotator = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            loop {
                ticker.tick().await;
                for proxy in &rotator.pool {
                    let Some(addr) = proxy.socket_addr() else {
                        warn!(
                            target: "lowband::proxy",
                            proxy = %proxy.id,
                            "Skipping health check; proxy url has no host"
                        );
                        continue;
                    };
                    if connect_with_timeout(&addr, check_timeout).await {
                        rotator.report_success(&proxy.id);
                    } else {
                        rotator.report_failure(&proxy.id);
                    }
                }
            }
        }))
    }

    pub fn is_healthy(&self, proxy_id: &str) -> bool {
        self.is_healthy_at(proxy_id, Instant::now())
    }

    pub(crate) fn is_healthy_at(&self, proxy_id: &str, now: Instant) -> bool {
        let Some(mut entry) = self.health.get_mut(proxy_id) else {
            return true;
        };
        let Some(since) = entry.down_since else {
            return true;
        };
        if self.policy.cooldown.is_zero() || now < since + self.policy.cooldown {
            return false;
        }
        // cooldown over: give it another chance with a clean slate
        entry.down_since = None;
        entry.consecutive_failures = 0;
        true
    }

    /// Record a failure through `proxy_id`. Returns true once the proxy
    /// has crossed the threshold and is marked down.
    pub fn report_failure(&self, proxy_id: &str) -> bool {
        let mut entry = self.health.entry(proxy_id.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        if entry.consecutive_failures >= self.policy.fail_threshold {
            if entry.down_since.is_none() {
                entry.down_since = Some(Instant::now());
                warn!(
                    target: "lowband::proxy",
                    proxy = %proxy_id,
                    failures = entry.consecutive_failures,
                    "Marking proxy as unhealthy"
                );
            }
            return true;
        }
        debug!(
            target: "lowband::proxy",
            proxy = %proxy_id,
            failures = entry.consecutive_failures,
            "Proxy failure recorded"
        );
        false
    }

    /// Record a success and clear the failure streak.
    ///
    /// A proxy already marked down stays down until its cooldown ends or
    /// it is marked healthy.
    pub fn report_success(&self, proxy_id: &str) {
        if let Some(mut entry) = self.health.get_mut(proxy_id) {
            if entry.down_since.is_none() {
                entry.consecutive_failures = 0;
            }
        }
    }

    /// Clear all failure state for `proxy_id`.
    pub fn mark_healthy(&self, proxy_id: &str) {
        if let Some(mut entry) = self.health.get_mut(proxy_id) {
            entry.consecutive_failures = 0;
            entry.down_since = None;
            debug!(target: "lowband::proxy", proxy = %proxy_id, "Proxy marked healthy");
        }
    }
}

/// Check a `host:port` with a TCP connect bounded by `timeout_dur`.
pub(crate) async fn connect_with_timeout(addr: &str, timeout_dur: Duration) -> bool {
    matches!(timeout(timeout_dur, TcpStream::connect(addr)).await, Ok(Ok(_)))
}
