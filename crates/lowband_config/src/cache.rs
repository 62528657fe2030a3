use serde::Deserialize;

// =======================================================
// CACHE CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch for the response cache.
    pub enabled: bool,
    /// TTL in seconds used when the upstream sends no max-age.
    pub default_ttl_secs: u64,
    /// Total byte budget of cached bodies; LRU eviction beyond it.
    pub capacity_bytes: u64,
    /// Largest single body that will be stored.
    pub max_object_bytes: u64,
    /// Request headers that take part in the fingerprint.
    pub vary_headers: Vec<String>,
    /// Sort query parameters before fingerprinting.
    pub sort_query: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            capacity_bytes: 64 * 1024 * 1024,
            max_object_bytes: 8 * 1024 * 1024,
            vary_headers: vec!["accept".into(), "accept-language".into()],
            sort_query: true,
        }
    }
}

impl CacheConfig {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn max_object_bytes(&self) -> u64 {
        self.max_object_bytes
    }

    pub fn vary_headers(&self) -> &[String] {
        &self.vary_headers
    }

    pub fn sort_query(&self) -> bool {
        self.sort_query
    }

    pub(crate) fn apply_defaults_from(&mut self, defaults: &CacheConfig) {
        if self.capacity_bytes == 0 {
            self.capacity_bytes = defaults.capacity_bytes;
        }
        if self.max_object_bytes == 0 {
            self.max_object_bytes = defaults.max_object_bytes;
        }
        for name in &mut self.vary_headers {
            *name = name.trim().to_ascii_lowercase();
        }
        self.vary_headers.retain(|name| !name.is_empty());
    }
}
