//! Upstream forwarding: one outbound request per cache miss, no retries.

use crate::error::{ApyError, ApyResult};
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use url::Url;

/// What the pipeline hands the forwarder.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub url: String,
    /// Inbound query string, used only when `url` has none of its own.
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl ForwardRequest {
    /// Target URL with the inbound query merged in.
    pub fn target(&self) -> ApyResult<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| ApyError::Upstream(format!("bad target url {}: {e}", self.url)))?;
        if url.query().is_none() {
            if let Some(q) = self.query.as_deref().filter(|q| !q.is_empty()) {
                url.set_query(Some(q));
            }
        }
        Ok(url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound half of the gateway. Dropping the returned future must abort
/// the call.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, req: ForwardRequest) -> ApyResult<UpstreamResponse>;
}

/// [`Upstream`] over a pooled `reqwest` client.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    via: String,
}

impl HttpForwarder {
    /// `via` is sent upstream in the `Via` header (e.g. `Apy/0.3.0`).
    pub fn new(timeout: Duration, via: &str) -> ApyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApyError::Internal(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            via: via.to_string(),
        })
    }
}

#[async_trait]
impl Upstream for HttpForwarder {
    async fn forward(&self, req: ForwardRequest) -> ApyResult<UpstreamResponse> {
        let url = req.target()?;
        let mut rb = self
            .client
            .request(req.method.clone(), url.as_str())
            .header(http::header::VIA, &self.via);
        if let Some(ct) = &req.content_type {
            rb = rb.header(http::header::CONTENT_TYPE, ct);
        }

        debug!(method = %req.method, url = %url, "upstream request");
        let started = Instant::now();
        let resp = rb.body(req.body).send().await.map_err(|e| {
            error!(url = %url, error = %e, "upstream request failed");
            ApyError::Upstream(e.to_string())
        })?;

        let status = resp.status().as_u16();
        // Reading to the end hands the connection back to the pool.
        let body = resp.text().await.map_err(|e| {
            error!(url = %url, error = %e, "reading upstream body failed");
            ApyError::Upstream(e.to_string())
        })?;
        info!(
            url = %url,
            status,
            upstream_ms = started.elapsed().as_millis() as u64,
            "upstream responded"
        );
        Ok(UpstreamResponse { status, body })
    }
}
