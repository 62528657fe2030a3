//! Upstream transport seam and its reqwest implementation.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lowband_config::TransportConfig;
use tracing::{debug, info, instrument};

use crate::request::{ProxyEndpoint, UpstreamRequest, UpstreamResponse};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid proxy '{proxy}': {reason}")]
    InvalidProxy { proxy: String, reason: String },
    #[error("upstream request via '{proxy}' timed out")]
    Timeout { proxy: String },
    #[error("could not connect via '{proxy}': {reason}")]
    Connect { proxy: String, reason: String },
    #[error("upstream request via '{proxy}' failed: {reason}")]
    Other { proxy: String, reason: String },
}

impl TransportError {
    pub fn proxy(&self) -> &str {
        match self {
            TransportError::InvalidProxy { proxy, .. }
            | TransportError::Timeout { proxy }
            | TransportError::Connect { proxy, .. }
            | TransportError::Other { proxy, .. } => proxy,
        }
    }
}

/// Performs one upstream exchange through the given egress proxy.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        request: &UpstreamRequest,
        proxy: &ProxyEndpoint,
    ) -> Result<UpstreamResponse, TransportError>;
}

/// reqwest-backed transport, one client (and connection pool) per proxy.
pub struct ReqwestTransport {
    cfg: TransportConfig,
    clients: DashMap<String, reqwest::Client>,
}

impl ReqwestTransport {
    pub fn new(cfg: TransportConfig) -> Self {
        Self {
            cfg,
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, proxy: &ProxyEndpoint) -> Result<reqwest::Client, TransportError> {
        if let Some(client) = self.clients.get(&proxy.id) {
            return Ok(client.clone());
        }

        let invalid = |e: reqwest::Error| TransportError::InvalidProxy {
            proxy: proxy.id.clone(),
            reason: e.to_string(),
        };

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(&proxy.url).map_err(invalid)?)
            .connect_timeout(Duration::from_secs(self.cfg.connect_timeout_secs()))
            .timeout(Duration::from_secs(self.cfg.request_timeout_secs()))
            .pool_max_idle_per_host(self.cfg.pool_max_idle_per_host())
            .user_agent(self.cfg.user_agent())
            .build()
            .map_err(invalid)?;

        info!(target: "lowband::http", proxy = %proxy.id, "Created upstream client for proxy");
        // racing inserts store equivalent clients
        self.clients.insert(proxy.id.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url, proxy = %proxy.id))]
    async fn fetch(
        &self,
        request: &UpstreamRequest,
        proxy: &ProxyEndpoint,
    ) -> Result<UpstreamResponse, TransportError> {
        let client = self.client_for(proxy)?;
        let map_err = |e: reqwest::Error| classify(proxy, e);

        let response = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_err)?;

        debug!(
            target: "lowband::http",
            status = status.as_u16(),
            body_len = body.len(),
            "Upstream responded"
        );

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(proxy: &ProxyEndpoint, e: reqwest::Error) -> TransportError {
    let proxy = proxy.id.clone();
    if e.is_timeout() {
        TransportError::Timeout { proxy }
    } else if e.is_connect() {
        TransportError::Connect {
            proxy,
            reason: e.to_string(),
        }
    } else {
        TransportError::Other {
            proxy,
            reason: e.to_string(),
        }
    }
}
