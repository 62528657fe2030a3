use serde::Deserialize;

// =======================================================
// DEDUP CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Hard limit a follower waits for its leader.
    pub wait_timeout_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait_timeout_ms: 30_000,
        }
    }
}

impl DedupConfig {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn wait_timeout_ms(&self) -> u64 {
        self.wait_timeout_ms
    }

    pub(crate) fn apply_defaults_from(&mut self, defaults: &DedupConfig) {
        if self.wait_timeout_ms == 0 {
            self.wait_timeout_ms = defaults.wait_timeout_ms;
        }
    }
}

// =======================================================
// RETRY CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_backoff_ms(&self) -> u64 {
        self.initial_backoff_ms
    }

    pub fn max_backoff_ms(&self) -> u64 {
        self.max_backoff_ms
    }

    pub(crate) fn apply_defaults_from(&mut self, defaults: &RetryConfig) {
        if self.max_attempts == 0 {
            self.max_attempts = defaults.max_attempts;
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            self.max_backoff_ms = self.initial_backoff_ms;
        }
    }
}
