use std::collections::HashSet;

use crate::{KNOWN_RESOURCE_TYPES, LowbandConfig};

/// Encodings the layer knows how to decode.
const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "x-gzip", "deflate", "br", "identity"];

/// Validation output for a loaded lowband configuration.
#[derive(Debug, Default)]
pub struct ConfigReport {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl ConfigReport {
    /// Returns true when no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true when at least one error was found.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns the collected warning messages.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Returns the collected error messages.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Render warnings and errors into a readable, multi-line string.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.errors.is_empty() {
            out.push_str("Errors:\n");
            for err in &self.errors {
                out.push_str("  - ");
                out.push_str(err);
                out.push('\n');
            }
        }
        if !self.warnings.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Warnings:\n");
            for warn in &self.warnings {
                out.push_str("  - ");
                out.push_str(warn);
                out.push('\n');
            }
        }
        out
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// Validate a lowband configuration and return a report of issues.
pub fn validate(cfg: &LowbandConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    validate_cache(cfg, &mut report);
    validate_proxies(cfg, &mut report);
    validate_policy(cfg, &mut report);
    validate_compression(cfg, &mut report);

    report
}

fn validate_cache(cfg: &LowbandConfig, report: &mut ConfigReport) {
    if !cfg.cache.enabled {
        return;
    }

    if cfg.cache.default_ttl_secs == 0 {
        report.warn("cache.default_ttl_secs is 0; responses without max-age will not be cached");
    }

    if cfg.cache.max_object_bytes > cfg.cache.capacity_bytes {
        report.warn(format!(
            "cache.max_object_bytes ({}) exceeds cache.capacity_bytes ({}); large objects evict everything",
            cfg.cache.max_object_bytes, cfg.cache.capacity_bytes
        ));
    }
}

fn validate_proxies(cfg: &LowbandConfig, report: &mut ConfigReport) {
    if cfg.proxy.pool.is_empty() {
        report.error("no [[proxy.pool]] entries found; at least one egress proxy is required");
        return;
    }

    let mut ids = HashSet::new();
    for (idx, endpoint) in cfg.proxy.pool.iter().enumerate() {
        if endpoint.id.is_empty() {
            report.error(format!("proxy.pool entry at index {idx} has an empty id"));
        } else if !ids.insert(endpoint.id.as_str()) {
            report.error(format!("proxy id '{}' is declared more than once", endpoint.id));
        }

        match url::Url::parse(&endpoint.url) {
            Ok(parsed) => {
                if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
                    report.error(format!(
                        "proxy '{id}' url '{url}' has unsupported scheme '{scheme}'",
                        id = endpoint.id,
                        url = endpoint.url,
                        scheme = parsed.scheme()
                    ));
                }
                if parsed.host_str().is_none() {
                    report.error(format!(
                        "proxy '{id}' url '{url}' has no host",
                        id = endpoint.id,
                        url = endpoint.url
                    ));
                }
            }
            Err(e) => report.error(format!(
                "proxy '{id}' url '{url}' is invalid: {e}",
                id = endpoint.id,
                url = endpoint.url
            )),
        }
    }

    if cfg.proxy.stickiness_secs == 0 {
        report.warn("proxy.stickiness_secs is 0; every request will rotate proxies");
    }

    if cfg.proxy.pool.len() == 1 {
        report.warn("proxy pool has a single entry; failures cannot rotate to another proxy");
    }
}

fn validate_policy(cfg: &LowbandConfig, report: &mut ConfigReport) {
    let mut seen = HashSet::new();
    for rule in &cfg.policy.rules {
        if !KNOWN_RESOURCE_TYPES.contains(&rule.resource.as_str()) {
            report.error(format!(
                "policy rule names unknown resource type '{}'",
                rule.resource
            ));
            continue;
        }
        if !seen.insert(rule.resource.as_str()) {
            report.warn(format!(
                "policy rule for '{}' is shadowed by an earlier rule",
                rule.resource
            ));
        }
    }
}

fn validate_compression(cfg: &LowbandConfig, report: &mut ConfigReport) {
    for enc in &cfg.compression.encodings {
        if !SUPPORTED_ENCODINGS.contains(&enc.as_str()) {
            report.error(format!(
                "compression encoding '{enc}' is not supported (supported: gzip, deflate, br)"
            ));
        }
    }
}
