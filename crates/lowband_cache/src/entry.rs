use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, StatusCode,
    header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED},
};
use tokio::time::{Duration, Instant};

use crate::key::Fingerprint;

/// ETag / Last-Modified pair used for conditional fetches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validator {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validator {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let read = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v: &HeaderValue| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let etag = read(ETAG);
        let last_modified = read(LAST_MODIFIED);
        if etag.is_none() && last_modified.is_none() {
            None
        } else {
            Some(Self {
                etag,
                last_modified,
            })
        }
    }

    /// Weak comparison for ETags; Last-Modified compared as instants.
    pub fn matches(&self, other: &Validator) -> bool {
        if let (Some(a), Some(b)) = (&self.etag, &other.etag) {
            return opaque_tag(a) == opaque_tag(b);
        }
        if let (Some(a), Some(b)) = (&self.last_modified, &other.last_modified) {
            return match (httpdate::parse_http_date(a), httpdate::parse_http_date(b)) {
                (Ok(a), Ok(b)) => a == b,
                _ => a == b,
            };
        }
        false
    }

    /// True when a client's own `If-None-Match` / `If-Modified-Since`
    /// says it already holds the representation this validator describes.
    /// `If-None-Match` takes precedence when present.
    pub fn not_modified_for(&self, request_headers: &HeaderMap) -> bool {
        let mut if_none_match = request_headers
            .get_all(IF_NONE_MATCH)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .peekable();
        if if_none_match.peek().is_some() {
            let Some(etag) = self.etag.as_deref() else {
                return false;
            };
            return if_none_match.any(|tag| tag == "*" || opaque_tag(tag) == opaque_tag(etag));
        }

        let since = request_headers
            .get(IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());
        let modified = self
            .last_modified
            .as_deref()
            .and_then(|v| httpdate::parse_http_date(v).ok());
        matches!((since, modified), (Some(since), Some(modified)) if modified <= since)
    }

    /// Add `If-None-Match` / `If-Modified-Since` to an outgoing request.
    pub fn apply_conditional(&self, headers: &mut HeaderMap) {
        if let Some(value) = self.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
            headers.insert(IF_NONE_MATCH, value);
        }
        if let Some(value) = self
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
    }
}

fn opaque_tag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag
        .strip_prefix("W/")
        .or_else(|| tag.strip_prefix("w/"))
        .unwrap_or(tag);
    tag.trim_matches('"')
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stored_at: Instant,
    pub ttl: Duration,
    pub validator: Option<Validator>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }

    /// Bytes charged against the cache budget.
    pub fn size(&self) -> u64 {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        (self.body.len() + headers) as u64
    }
}
