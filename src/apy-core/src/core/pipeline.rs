//! Request pipeline: resolve, rate check, auth check, serve, post-process.
//!
//! Each stage returns `ApyResult`; the first `Err` ends the request and no
//! later stage runs. Counters only move in post-process, through the
//! [`Permit`] taken at the rate check.

use super::forwarder::{ForwardRequest, Upstream, UpstreamResponse};
use super::limiter::{Permit, RateLimiter};
use super::registry::{EndpointSlot, Registry};
use crate::error::{ApyError, ApyResult};
use crate::models::RouteId;
use apy_crypto::{TokenAuthority, TokenStatus};
use bytes::Bytes;
use http::Method;
use std::sync::Arc;
use tracing::debug;

/// An inbound request addressed to a registered endpoint.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: None,
            authorization: None,
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn with_authorization(mut self, value: &str) -> Self {
        self.authorization = Some(value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub route: RouteId,
    pub body: String,
    pub upstream_status: Option<u16>,
    pub cache_hit: bool,
}

struct Served {
    body: String,
    upstream: Option<UpstreamResponse>,
}

pub struct Pipeline {
    registry: Arc<Registry>,
    limiter: RateLimiter,
    tokens: Arc<dyn TokenAuthority>,
    upstream: Arc<dyn Upstream>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<Registry>,
        limiter: RateLimiter,
        tokens: Arc<dyn TokenAuthority>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            registry,
            limiter,
            tokens,
            upstream,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn run(&self, req: ProxyRequest) -> ApyResult<ProxyResponse> {
        let slot = self.registry.resolve(&req.path, req.method.as_str())?;
        let permit = self.limiter.acquire(&slot)?;
        self.auth_check(&slot, req.authorization.as_deref())?;
        let served = self.serve(&slot, req).await?;
        Ok(self.post_process(slot, permit, served).await)
    }

    fn auth_check(&self, slot: &EndpointSlot, header: Option<&str>) -> ApyResult<()> {
        if !slot.with_state(|s| s.endpoint.auth_enabled) {
            return Ok(());
        }
        let header = header.ok_or(ApyError::MissingToken)?;
        let token = match header.split(' ').collect::<Vec<_>>().as_slice() {
            [scheme, token] if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() => *token,
            _ => return Err(ApyError::MalformedToken),
        };
        match self.tokens.validate(token) {
            TokenStatus::Valid => Ok(()),
            TokenStatus::Expired => {
                debug!(route = %slot.id(), "expired token");
                Err(ApyError::TokenExpired)
            }
            TokenStatus::Invalid => {
                debug!(route = %slot.id(), "invalid token");
                Err(ApyError::TokenInvalid)
            }
        }
    }

    async fn serve(&self, slot: &EndpointSlot, req: ProxyRequest) -> ApyResult<Served> {
        if let Some(body) = slot.cached_body() {
            debug!(route = %slot.id(), "cache hit");
            return Ok(Served {
                body,
                upstream: None,
            });
        }

        let url = slot.with_state(|s| s.endpoint.url.clone());
        let resp = self
            .upstream
            .forward(ForwardRequest {
                method: req.method,
                url,
                query: req.query,
                content_type: req.content_type,
                body: req.body,
            })
            .await?;
        Ok(Served {
            body: resp.body.clone(),
            upstream: Some(resp),
        })
    }

    async fn post_process(
        &self,
        slot: Arc<EndpointSlot>,
        permit: Permit,
        served: Served,
    ) -> ProxyResponse {
        if let Some(resp) = served.upstream.as_ref().filter(|r| r.is_success()) {
            slot.fill_cache(&resp.body);
        }
        permit.commit();
        self.registry.persist(&slot).await;

        ProxyResponse {
            route: slot.id().clone(),
            upstream_status: served.upstream.as_ref().map(|r| r.status),
            cache_hit: served.upstream.is_none(),
            body: served.body,
        }
    }
}
