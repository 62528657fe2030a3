//! The request pipeline.
//!
//! Received -> Classified -> (Blocked | CacheLookup)
//! CacheLookup -> (Hit | Dedup)
//! Dedup -> (Leader: fetch upstream | Follower: wait)
//! fetch -> Decode -> Store -> Completed

use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, StatusCode,
    header::{CONTENT_ENCODING, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE},
};
use lowband_cache::{CacheEntry, CacheManager, CachePolicy, Fingerprint, Revalidation, Validator};
use lowband_config::{LowbandConfig, RetryConfig};
use lowband_http::{
    DecodeError, Negotiator, ProxyEndpoint, RequestDescriptor, Transport, TransportError,
    UpstreamRequest, UpstreamResponse,
};
use lowband_proxy::Rotator;
use tokio::{
    task::spawn_blocking,
    time::{Duration, sleep},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    accountant::{BandwidthAccountant, BandwidthSnapshot, Tally},
    classifier::{BlockReason, Decision, ResourcePolicy},
    dedup::{Deduplicator, Role, WaitError},
    error::PipelineError,
};

/// Client conditionals never reach the origin on the shared path; they are
/// answered locally against the shared response.
const CLIENT_CONDITIONALS: [HeaderName; 4] = [IF_NONE_MATCH, IF_MODIFIED_SINCE, IF_MATCH, IF_RANGE];

/// Encoded bodies above this size are decoded off the async workers.
const INLINE_DECODE_LIMIT: usize = 64 * 1024;

/// How a response was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Refused by policy; nothing left the process.
    Blocked(BlockReason),
    CacheHit,
    /// Served from cache after the origin answered 304.
    Revalidated,
    Fetched,
    /// Shared from an identical request already in flight.
    Deduplicated,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub outcome: Outcome,
    /// Egress used, when the response crossed the wire.
    pub proxy_id: Option<String>,
}

impl ProxyResponse {
    fn blocked(reason: BlockReason) -> Self {
        Self {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            outcome: Outcome::Blocked(reason),
            proxy_id: None,
        }
    }

    fn from_entry(entry: CacheEntry, outcome: Outcome, proxy_id: Option<String>) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
            outcome,
            proxy_id,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.outcome, Outcome::Blocked(_))
    }

    /// Turn a shared 200 into this caller's 304 when its own
    /// `If-None-Match` / `If-Modified-Since` already covers it.
    fn answer_conditional(mut self, request_headers: &HeaderMap) -> Self {
        if self.status != StatusCode::OK {
            return self;
        }
        let Some(validator) = Validator::from_headers(&self.headers) else {
            return self;
        };
        if validator.not_modified_for(request_headers) {
            self.status = StatusCode::NOT_MODIFIED;
            self.body = Bytes::new();
        }
        self
    }
}

type Shared = Result<ProxyResponse, PipelineError>;

/// =======================================================
/// PIPELINE
/// =======================================================
///
/// Owns one instance of every component. Shared across tasks as
/// `Arc<Pipeline>`; all methods take `&self`.
pub struct Pipeline {
    policy: RwLock<Arc<ResourcePolicy>>,

    /// `None` when caching is disabled
    cache: Option<CacheManager>,

    dedup: Option<Deduplicator<Shared>>,
    dedup_wait: Duration,

    negotiator: Negotiator,
    rotator: Arc<Rotator>,
    accountant: BandwidthAccountant,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
}

impl Pipeline {
    pub fn new(cfg: &LowbandConfig, transport: Arc<dyn Transport>) -> Self {
        let cache = cfg.cache().enabled().then(|| CacheManager::new(cfg.cache()));
        Self::with_cache(cfg, transport, cache)
    }

    pub fn with_cache(
        cfg: &LowbandConfig,
        transport: Arc<dyn Transport>,
        cache: Option<CacheManager>,
    ) -> Self {
        Self {
            policy: RwLock::new(Arc::new(ResourcePolicy::from_config(cfg.policy()))),
            cache,
            dedup: cfg.dedup().enabled().then(Deduplicator::new),
            dedup_wait: Duration::from_millis(cfg.dedup().wait_timeout_ms()),
            negotiator: Negotiator::new(cfg.compression()),
            rotator: Arc::new(Rotator::from_config(cfg.proxy())),
            accountant: BandwidthAccountant::new(),
            transport,
            retry: cfg.retry().clone(),
        }
    }

    pub fn rotator(&self) -> &Arc<Rotator> {
        &self.rotator
    }

    pub fn cache(&self) -> Option<&CacheManager> {
        self.cache.as_ref()
    }

    pub fn stats(&self) -> BandwidthSnapshot {
        self.accountant.snapshot()
    }

    /// Swap the resource policy. Requests already past classification keep
    /// the policy they started with.
    pub fn reload_policy(&self, policy: ResourcePolicy) {
        let mut current = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(policy);
        info!(target: "lowband::policy", "Resource policy reloaded");
    }

    fn current_policy(&self) -> Arc<ResourcePolicy> {
        Arc::clone(&self.policy.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Run one request through the pipeline on behalf of `session_id`.
    #[instrument(
        skip_all,
        fields(method = %req.method, url = %req.url, session = %session_id)
    )]
    pub async fn handle(
        &self,
        req: &RequestDescriptor,
        session_id: &str,
    ) -> Result<ProxyResponse, PipelineError> {
        if req.url.host_str().is_none() {
            return Err(PipelineError::InvalidRequest(format!(
                "url '{}' has no host",
                req.url
            )));
        }

        let resource_type = req.resource_type();
        if let Decision::Block(reason) = self.current_policy().classify(resource_type, &req.url) {
            debug!(target: "lowband::pipeline", %resource_type, %reason, "Blocked");
            self.accountant.record_request(session_id, Tally::Blocked);
            return Ok(ProxyResponse::blocked(reason));
        }
        debug!(target: "lowband::pipeline", %resource_type, "Classified");

        let result = if CachePolicy::is_cacheable(&req.method) {
            self.handle_shared(req, session_id).await
        } else {
            // writes are never cached or coalesced
            self.fetch(req, session_id, None).await
        };

        let tally = match &result {
            Ok(resp) => match resp.outcome {
                Outcome::CacheHit | Outcome::Revalidated => Tally::CacheHit,
                Outcome::Deduplicated => Tally::Deduplicated,
                _ => Tally::Served,
            },
            Err(_) => Tally::Failed,
        };
        self.accountant.record_request(session_id, tally);
        result
    }

    async fn handle_shared(&self, req: &RequestDescriptor, session_id: &str) -> Shared {
        self.shared_response(req, session_id)
            .await
            .map(|resp| resp.answer_conditional(&req.headers))
    }

    async fn shared_response(&self, req: &RequestDescriptor, session_id: &str) -> Shared {
        let key = self.fingerprint(req);
        let revalidate = req.wants_revalidation();

        if !revalidate {
            if let Some(resp) = self.cache_hit(&key, session_id) {
                return Ok(resp);
            }
        }

        let Some(dedup) = &self.dedup else {
            return self.fetch(req, session_id, Some(&key)).await;
        };

        match dedup.acquire(key.clone()) {
            Role::Leader(ticket) => {
                debug!(target: "lowband::pipeline", key = %key.short(), "Leading upstream fetch");
                // an earlier leader may have stored the body since our lookup
                let result = match (!revalidate).then(|| self.cache_hit(&key, session_id)) {
                    Some(Some(resp)) => Ok(resp),
                    _ => self.fetch(req, session_id, Some(&key)).await,
                };
                ticket.resolve(result.clone());
                result
            }
            Role::Follower(ticket) => match ticket.wait(self.dedup_wait).await {
                Ok(Ok(mut resp)) => {
                    self.accountant.record_saved(session_id, resp.body.len() as u64);
                    resp.outcome = Outcome::Deduplicated;
                    Ok(resp)
                }
                Ok(Err(e)) => Err(e),
                Err(WaitError::Timeout) => {
                    warn!(
                        target: "lowband::pipeline",
                        key = %key.short(),
                        waited_ms = self.dedup_wait.as_millis() as u64,
                        "Gave up waiting on in-flight request"
                    );
                    Err(PipelineError::DedupTimeout {
                        waited_ms: self.dedup_wait.as_millis() as u64,
                    })
                }
                Err(WaitError::LeaderGone) => Err(PipelineError::LeaderAborted),
            },
        }
    }

    fn fingerprint(&self, req: &RequestDescriptor) -> Fingerprint {
        match &self.cache {
            Some(cache) => cache.fingerprint(&req.method, &req.url, &req.headers),
            None => Fingerprint::compute(&req.method, &req.url, &req.headers, &Default::default()),
        }
    }

    fn cache_hit(&self, key: &Fingerprint, session_id: &str) -> Option<ProxyResponse> {
        let entry = self.cache.as_ref()?.get(key)?;
        self.accountant.record_saved(session_id, entry.body.len() as u64);
        Some(ProxyResponse::from_entry(entry, Outcome::CacheHit, None))
    }

    /// Upstream leg: conditional fetch when a validator is on file, then
    /// decode and store.
    async fn fetch(
        &self,
        req: &RequestDescriptor,
        session_id: &str,
        key: Option<&Fingerprint>,
    ) -> Shared {
        let cache = key.and_then(|k| self.cache.as_ref().map(|c| (c, k)));
        let mut upstream = UpstreamRequest::from_descriptor(req);
        self.negotiator.advertise(&mut upstream.headers);
        if key.is_some() {
            for name in &CLIENT_CONDITIONALS {
                upstream.headers.remove(name);
            }
        }

        let sent = cache.and_then(|(c, k)| c.validator(k));
        if let Some(validator) = &sent {
            validator.apply_conditional(&mut upstream.headers);
        }

        let (mut resp, mut proxy) = self.fetch_with_retry(&upstream, session_id).await?;

        if let (Some(sent), Some((cache, key))) = (sent, cache) {
            if resp.status == StatusCode::NOT_MODIFIED {
                let confirmed = Validator::from_headers(&resp.headers).unwrap_or(sent);
                let refreshed = cache.policy().refreshed_ttl(&resp.headers);
                match cache.revalidate(key, &confirmed, refreshed) {
                    Revalidation::Fresh(entry) => {
                        debug!(target: "lowband::pipeline", key = %key.short(), "Revalidated");
                        self.accountant
                            .record_saved(session_id, entry.body.len() as u64);
                        return Ok(ProxyResponse::from_entry(
                            entry,
                            Outcome::Revalidated,
                            Some(proxy.id),
                        ));
                    }
                    Revalidation::Stale => {
                        debug!(target: "lowband::pipeline", key = %key.short(), "Stale after 304; refetching");
                        upstream.headers.remove(IF_NONE_MATCH);
                        upstream.headers.remove(IF_MODIFIED_SINCE);
                        (resp, proxy) = self.fetch_with_retry(&upstream, session_id).await?;
                    }
                }
            }
        }

        let UpstreamResponse {
            status,
            headers,
            body,
        } = resp;

        // the origin answered afresh; whatever was stored no longer stands
        if let Some((cache, key)) = cache {
            if status != StatusCode::NOT_MODIFIED {
                cache.invalidate(key);
            }
        }

        let (headers, body) = self.decode(headers, body).await.inspect_err(|e| {
            warn!(target: "lowband::pipeline", proxy = %proxy.id, error = %e, "Decoding failed");
        })?;

        if let Some((cache, key)) = cache {
            if let Some(ttl) = cache.policy().ttl_for(status, &headers) {
                cache.put(key, status, headers.clone(), body.clone(), ttl);
            }
        }

        Ok(ProxyResponse {
            status,
            headers,
            body,
            outcome: Outcome::Fetched,
            proxy_id: Some(proxy.id),
        })
    }

    async fn decode(
        &self,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<(HeaderMap, Bytes), DecodeError> {
        if body.len() <= INLINE_DECODE_LIMIT || !headers.contains_key(CONTENT_ENCODING) {
            let body = self.negotiator.decode(&mut headers, body)?;
            return Ok((headers, body));
        }

        let negotiator = self.negotiator.clone();
        let decoded = spawn_blocking(move || {
            negotiator
                .decode(&mut headers, body)
                .map(|body| (headers, body))
        })
        .await;
        match decoded {
            Ok(result) => result,
            Err(e) => Err(DecodeError::Malformed {
                encoding: "content-encoding".to_string(),
                reason: format!("decoder task failed: {e}"),
            }),
        }
    }

    /// Send through the session's proxy, retrying with exponential backoff.
    ///
    /// Every failure counts against the proxy used. The attempt that marks a
    /// proxy down does not spend the retry budget: the next attempt goes to
    /// the proxy the rotator moves to. Errors surface once the budget is
    /// spent or the rotator has nothing left.
    async fn fetch_with_retry(
        &self,
        upstream: &UpstreamRequest,
        session_id: &str,
    ) -> Result<(UpstreamResponse, ProxyEndpoint), PipelineError> {
        let max_attempts = self.retry.max_attempts().max(1);
        let mut backoff = Duration::from_millis(self.retry.initial_backoff_ms());
        let max_backoff = Duration::from_millis(self.retry.max_backoff_ms());
        let bytes_out = upstream.wire_len();
        let mut attempts = 0;
        let mut spent = 0;
        let mut rotations = 0;
        let mut last_error: Option<TransportError> = None;

        loop {
            let proxy = match self.rotator.select(session_id) {
                Ok(proxy) => proxy,
                Err(e) => {
                    return Err(match last_error {
                        Some(last_error) => {
                            warn!(
                                target: "lowband::pipeline",
                                attempts,
                                error = %last_error,
                                "No proxy left to retry on"
                            );
                            PipelineError::TransportFailure {
                                attempts,
                                last_error,
                            }
                        }
                        None => e.into(),
                    });
                }
            };
            attempts += 1;

            let err = match self.transport.fetch(upstream, &proxy).await {
                Ok(resp) => {
                    let bytes_in = resp.wire_len();
                    self.rotator.report_success(&proxy.id);
                    self.rotator
                        .record_transfer(session_id, &proxy.id, bytes_in + bytes_out);
                    self.accountant
                        .record(session_id, Some(&proxy.id), bytes_in, bytes_out);
                    debug!(
                        target: "lowband::pipeline",
                        proxy = %proxy.id,
                        status = resp.status.as_u16(),
                        bytes_in,
                        attempts,
                        "Fetched"
                    );
                    return Ok((resp, proxy));
                }
                Err(e) => e,
            };

            let rotated =
                self.rotator.report_failure(&proxy.id) && rotations < self.rotator.pool().len();
            if rotated {
                rotations += 1;
                info!(target: "lowband::pipeline", proxy = %proxy.id, "Proxy unhealthy; rotating");
            } else {
                spent += 1;
            }

            if spent >= max_attempts {
                warn!(target: "lowband::pipeline", attempts, error = %err, "Giving up");
                return Err(PipelineError::TransportFailure {
                    attempts,
                    last_error: err,
                });
            }

            if !rotated {
                debug!(
                    target: "lowband::pipeline",
                    proxy = %proxy.id,
                    attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retrying"
                );
                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            last_error = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, Pipeline};
    use crate::{ResourcePolicy, classifier::BlockReason};
    use async_trait::async_trait;
    use http::{HeaderMap, Method, StatusCode};
    use lowband_config::{LowbandConfig, ProxyEndpointConfig, RuleAction};
    use lowband_http::{
        ProxyEndpoint, RequestDescriptor, ResourceType, Transport, TransportError,
        UpstreamRequest, UpstreamResponse,
    };
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use url::Url;

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Echo {
        async fn fetch(
            &self,
            request: &UpstreamRequest,
            _proxy: &ProxyEndpoint,
        ) -> Result<UpstreamResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: request.url.path().to_string().into(),
            })
        }
    }

    fn config() -> LowbandConfig {
        let mut cfg = LowbandConfig::default();
        cfg.proxy.pool = vec![ProxyEndpointConfig {
            id: "p1".into(),
            url: "http://127.0.0.1:3128".into(),
        }];
        cfg
    }

    #[tokio::test]
    async fn blocked_request_never_reaches_transport() {
        let transport = Arc::new(Echo::default());
        let pipeline = Pipeline::new(&config(), transport.clone());

        let req = RequestDescriptor::get("https://example.com/hero.jpg").unwrap();
        let resp = pipeline.handle(&req, "s1").await.unwrap();

        assert_eq!(
            resp.outcome,
            Outcome::Blocked(BlockReason::ResourceType(ResourceType::Image))
        );
        assert!(resp.body.is_empty());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        let totals = pipeline.stats().sessions["s1"];
        assert_eq!((totals.bytes_in, totals.bytes_out, totals.blocked), (0, 0, 1));
    }

    #[tokio::test]
    async fn reloaded_policy_applies_to_next_request() {
        let transport = Arc::new(Echo::default());
        let pipeline = Pipeline::new(&config(), transport.clone());
        let req = RequestDescriptor::get("https://example.com/hero.jpg").unwrap();
        assert!(pipeline.handle(&req, "s1").await.unwrap().is_blocked());

        pipeline.reload_policy(
            ResourcePolicy::allow_all().with_rule(ResourceType::Image, RuleAction::Allow),
        );
        let resp = pipeline.handle(&req, "s1").await.unwrap();
        assert_eq!(resp.outcome, Outcome::Fetched);
        assert_eq!(&resp.body[..], b"/hero.jpg");
    }

    #[tokio::test]
    async fn writes_bypass_cache() {
        let transport = Arc::new(Echo::default());
        let pipeline = Pipeline::new(&config(), transport.clone());
        let url = Url::parse("https://example.com/form").unwrap();
        let req = RequestDescriptor::new(Method::POST, url).with_body("a=1");

        for _ in 0..2 {
            assert_eq!(pipeline.handle(&req, "s1").await.unwrap().outcome, Outcome::Fetched);
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.cache().unwrap().stats().entries, 0);
    }

    #[tokio::test]
    async fn second_get_is_a_cache_hit() {
        let transport = Arc::new(Echo::default());
        let pipeline = Pipeline::new(&config(), transport.clone());
        let req = RequestDescriptor::get("https://example.com/page").unwrap();

        assert_eq!(pipeline.handle(&req, "s1").await.unwrap().outcome, Outcome::Fetched);
        let hit = pipeline.handle(&req, "s1").await.unwrap();
        assert_eq!(hit.outcome, Outcome::CacheHit);
        assert_eq!(&hit.body[..], b"/page");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let totals = pipeline.stats().sessions["s1"];
        assert_eq!(totals.cache_hits, 1);
        assert_eq!(totals.bytes_saved, 5);
    }

    #[tokio::test]
    async fn disabled_cache_always_fetches() {
        let mut cfg = config();
        cfg.cache.enabled = false;
        let transport = Arc::new(Echo::default());
        let pipeline = Pipeline::new(&cfg, transport.clone());
        let req = RequestDescriptor::get("https://example.com/page").unwrap();

        pipeline.handle(&req, "s1").await.unwrap();
        pipeline.handle(&req, "s1").await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(pipeline.cache().is_none());
    }

    #[tokio::test]
    async fn url_without_host_is_invalid() {
        let pipeline = Pipeline::new(&config(), Arc::new(Echo::default()));
        let req = RequestDescriptor::new(Method::GET, Url::parse("data:text/plain,hi").unwrap());
        assert!(matches!(
            pipeline.handle(&req, "s1").await,
            Err(crate::PipelineError::InvalidRequest(_))
        ));
    }
}
