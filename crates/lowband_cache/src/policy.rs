use http::{HeaderMap, Method, StatusCode, header::CACHE_CONTROL};
use lowband_config::CacheConfig;
use tokio::time::Duration;

/// Decides what may be stored and for how long.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    default_ttl: Duration,
    max_object_bytes: u64,
}

impl CachePolicy {
    pub fn new(default_ttl: Duration, max_object_bytes: u64) -> Self {
        Self {
            default_ttl,
            max_object_bytes,
        }
    }

    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.default_ttl_secs()),
            cfg.max_object_bytes(),
        )
    }

    pub fn is_cacheable(method: &Method) -> bool {
        matches!(*method, Method::GET | Method::HEAD)
    }

    pub fn fits(&self, size: u64) -> bool {
        size <= self.max_object_bytes
    }

    /// TTL for a response, or `None` when it must not be stored.
    ///
    /// `no-cache` responses are stored with a zero TTL so every use revalidates.
    pub fn ttl_for(&self, status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
        if !matches!(status.as_u16(), 200 | 203 | 204 | 301) {
            return None;
        }

        let directives = Directives::parse(headers);
        if directives.no_store {
            return None;
        }
        if directives.no_cache {
            return Some(Duration::ZERO);
        }
        Some(directives.freshness().unwrap_or(self.default_ttl))
    }

    /// Explicit freshness carried by a 304, used to restart a revalidated
    /// entry with the origin's new lifetime. `None` keeps the stored TTL.
    pub fn refreshed_ttl(&self, headers: &HeaderMap) -> Option<Duration> {
        let directives = Directives::parse(headers);
        if directives.no_cache {
            return Some(Duration::ZERO);
        }
        directives.freshness()
    }
}

#[derive(Debug, Default)]
struct Directives {
    no_store: bool,
    no_cache: bool,
    max_age: Option<u64>,
    s_maxage: Option<u64>,
}

impl Directives {
    fn parse(headers: &HeaderMap) -> Self {
        let mut directives = Directives::default();
        for token in headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
        {
            let token = token.trim().to_ascii_lowercase();
            match token.as_str() {
                "no-store" | "private" => directives.no_store = true,
                "no-cache" => directives.no_cache = true,
                _ => {}
            }
            if let Some(secs) = token.strip_prefix("s-maxage=") {
                directives.s_maxage = secs.trim_matches('"').parse::<u64>().ok();
            } else if let Some(secs) = token.strip_prefix("max-age=") {
                directives.max_age = secs.trim_matches('"').parse::<u64>().ok();
            }
        }
        directives
    }

    fn freshness(&self) -> Option<Duration> {
        self.s_maxage.or(self.max_age).map(Duration::from_secs)
    }
}
