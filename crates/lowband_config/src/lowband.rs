use serde::Deserialize;
use tracing::{info, warn};

use crate::validation::{ConfigReport, validate};
use crate::{
    CacheConfig, CompressionConfig, DedupConfig, PolicyConfig, ProxyConfig, RetryConfig,
    TransportConfig,
};

/// Prefix for environment overrides, e.g. `LOWBAND__CACHE__DEFAULT_TTL_SECS=60`.
const ENV_PREFIX: &str = "LOWBAND";

// =======================================================
// LOWBAND CONFIG - main config
// =======================================================
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LowbandConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl LowbandConfig {
    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    pub fn dedup(&self) -> &DedupConfig {
        &self.dedup
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn compression(&self) -> &CompressionConfig {
        &self.compression
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Validate the configuration and return a report of warnings and errors.
    pub fn validate(&self) -> ConfigReport {
        validate(self)
    }

    /// Load a TOML file (optional) layered under `LOWBAND__*` environment overrides.
    pub fn from_file(file_name: &str) -> Result<Self, config::ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::new(file_name, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let mut cfg: LowbandConfig = built.try_deserialize()?;

        cfg.apply_defaults();
        Ok(cfg)
    }

    /// Parse a TOML document directly (no environment layer).
    pub fn from_toml_str(raw: &str) -> Result<Self, config::ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?;

        let mut cfg: LowbandConfig = built.try_deserialize()?;

        cfg.apply_defaults();
        Ok(cfg)
    }

    pub fn from_file_or_default(file_name: &str) -> Self {
        match Self::from_file(file_name) {
            Ok(cfg) => {
                let report = cfg.validate();
                if report.has_errors() {
                    warn!(
                        target: "lowband::config",
                        file = %file_name,
                        report = %report.format(),
                        "Invalid config; using defaults"
                    );
                    LowbandConfig::default()
                } else {
                    if !report.warnings().is_empty() {
                        warn!(
                            target: "lowband::config",
                            file = %file_name,
                            report = %report.format(),
                            "Config loaded with warnings"
                        );
                    }
                    cfg
                }
            }
            Err(e) => {
                warn!(
                    target: "lowband::config",
                    file = %file_name,
                    error = %e,
                    "Error reading config; using defaults"
                );
                LowbandConfig::default()
            }
        }
    }

    fn apply_defaults(&mut self) {
        self.cache.apply_defaults_from(&CacheConfig::default());
        self.dedup.apply_defaults_from(&DedupConfig::default());
        self.retry.apply_defaults_from(&RetryConfig::default());
        self.proxy.apply_defaults_from(&ProxyConfig::default());
        self.transport.apply_defaults_from(&TransportConfig::default());
        self.policy.apply_defaults();
        self.compression.apply_defaults();
    }

    /// Log a summary of the effective configuration.
    pub fn print(&self) {
        info!(
            target: "lowband::config",
            enabled = self.cache.enabled,
            default_ttl_secs = self.cache.default_ttl_secs,
            capacity_bytes = self.cache.capacity_bytes,
            max_object_bytes = self.cache.max_object_bytes,
            vary_headers = ?self.cache.vary_headers,
            "[cache]"
        );
        info!(
            target: "lowband::config",
            enabled = self.dedup.enabled,
            wait_timeout_ms = self.dedup.wait_timeout_ms,
            "[dedup]"
        );
        info!(
            target: "lowband::config",
            max_attempts = self.retry.max_attempts,
            initial_backoff_ms = self.retry.initial_backoff_ms,
            max_backoff_ms = self.retry.max_backoff_ms,
            "[retry]"
        );
        let ids: Vec<&str> = self.proxy.pool.iter().map(|p| p.id.as_str()).collect();
        info!(
            target: "lowband::config",
            pool = ?ids,
            stickiness_secs = self.proxy.stickiness_secs,
            fail_threshold = self.proxy.fail_threshold,
            cooldown_secs = self.proxy.cooldown_secs,
            active_health = self.proxy.health.active,
            "[proxy]"
        );
        info!(
            target: "lowband::config",
            rules = self.policy.rules.len(),
            default = ?self.policy.default,
            blocked_hosts = self.policy.blocked_hosts.len(),
            "[policy]"
        );
        info!(
            target: "lowband::config",
            encodings = ?self.compression.encodings,
            "[compression]"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::LowbandConfig;
    use crate::RuleAction;

    #[test]
    fn from_toml_str_fills_missing_sections_with_defaults() {
        let cfg = LowbandConfig::from_toml_str(
            r#"
            [cache]
            default_ttl_secs = 60
            vary_headers = [" Accept ", ""]

            [[proxy.pool]]
            id = "p1"
            url = "http://127.0.0.1:3128"
            "#,
        )
        .expect("config should parse");

        assert_eq!(cfg.cache.default_ttl_secs, 60);
        assert_eq!(cfg.cache.vary_headers, vec!["accept".to_string()]);
        assert_eq!(cfg.proxy.pool.len(), 1);
        assert_eq!(cfg.proxy.fail_threshold, 3);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.policy.default, RuleAction::Allow);
    }

    #[test]
    fn from_toml_str_reads_policy_rules_in_order() {
        let cfg = LowbandConfig::from_toml_str(
            r#"
            [policy]
            default = "block"
            blocked_hosts = [".Ads.Example.com"]

            [[policy.rules]]
            resource = "Document"
            action = "allow"

            [[policy.rules]]
            resource = "xhr"
            action = "allow"
            "#,
        )
        .expect("config should parse");

        assert_eq!(cfg.policy.default, RuleAction::Block);
        assert_eq!(cfg.policy.rules[0].resource, "document");
        assert_eq!(cfg.policy.rules[1].resource, "xhr");
        assert_eq!(cfg.policy.blocked_hosts, vec!["ads.example.com".to_string()]);
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let cfg = LowbandConfig::from_toml_str(
            r#"
            [retry]
            max_attempts = 0
            initial_backoff_ms = 500
            max_backoff_ms = 10

            [dedup]
            wait_timeout_ms = 0
            "#,
        )
        .expect("config should parse");

        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.max_backoff_ms, 500);
        assert_eq!(cfg.dedup.wait_timeout_ms, 30_000);
    }
}
