use std::fmt;

use http::{HeaderMap, Method};
use lowband_config::CacheConfig;
use sha2::{Digest, Sha256};
use url::Url;

/// Which parts of a request beyond method + URL make it distinct.
#[derive(Debug, Clone)]
pub struct KeyRules {
    vary_headers: Vec<String>,
    sort_query: bool,
}

impl KeyRules {
    pub fn new(vary_headers: Vec<String>, sort_query: bool) -> Self {
        let mut vary_headers: Vec<String> = vary_headers
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        vary_headers.sort();
        vary_headers.dedup();
        Self {
            vary_headers,
            sort_query,
        }
    }

    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::new(cfg.vary_headers().to_vec(), cfg.sort_query())
    }
}

impl Default for KeyRules {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Content-addressed identity of a request: SHA-256 over method,
/// normalized URL and the vary header subset.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(method: &Method, url: &Url, headers: &HeaderMap, rules: &KeyRules) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(normalize_url(url, rules.sort_query).as_bytes());
        hasher.update(b"\n");
        for name in &rules.vary_headers {
            let mut values: Vec<&str> = headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::trim)
                .collect();
            if values.is_empty() {
                continue;
            }
            values.sort_unstable();
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(values.join(",").as_bytes());
            hasher.update(b"\n");
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 12 hex chars, enough to tell keys apart in logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheme/host case and default ports are already normalized by `Url`.
/// Here the fragment is dropped and, optionally, the query sorted.
fn normalize_url(url: &Url, sort_query: bool) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    if sort_query {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            pairs.sort();
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }

    url.to_string()
}
