use anyhow::{Context, Result};
use apy_core::{ApyError, ApyResult, Pipeline, ProxyRequest};
use apy_crypto::TokenAuthority;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, SERVER};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

mod admin;

// Inject app name at compile-time from the workspace Cargo.toml
const APP_NAME: &str = env!("APP_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `Server` header value, e.g. `Apy/0.3.0`.
pub fn server_name() -> String {
    format!("{}/{}", APP_NAME, APP_VERSION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminRoute {
    Auth,
    Add,
    Delete,
    Metrics,
}

impl AdminRoute {
    fn method(self) -> Method {
        match self {
            AdminRoute::Auth | AdminRoute::Metrics => Method::GET,
            AdminRoute::Add => Method::POST,
            AdminRoute::Delete => Method::DELETE,
        }
    }
}

/// JSON reply before the common headers are applied.
pub(crate) struct Reply {
    status: StatusCode,
    body: Value,
    cache_hit: bool,
}

impl Reply {
    pub(crate) fn new(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            body,
            cache_hit: false,
        }
    }

    pub(crate) fn ok(body: Value) -> Self {
        Self::new(StatusCode::OK, body)
    }
}

impl From<ApyError> for Reply {
    fn from(e: ApyError) -> Self {
        match &e {
            ApyError::Internal(detail) => error!(error = %detail, "internal error"),
            ApyError::Persistence(detail) => error!(error = %detail, "store failure"),
            other => debug!(error = %other, "request rejected"),
        }
        Reply::new(e.status(), e.body())
    }
}

/// The HTTP face of the gateway: four admin routes, everything else goes
/// through the request pipeline.
pub struct Gateway {
    pipeline: Arc<Pipeline>,
    tokens: Arc<dyn TokenAuthority>,
    admin: matchit::Router<AdminRoute>,
}

impl Gateway {
    pub fn new(pipeline: Arc<Pipeline>, tokens: Arc<dyn TokenAuthority>) -> Result<Self> {
        let mut admin = matchit::Router::new();
        admin.insert("/auth", AdminRoute::Auth)?;
        admin.insert("/add", AdminRoute::Add)?;
        admin.insert("/delete/{*path}", AdminRoute::Delete)?;
        admin.insert("/metrics", AdminRoute::Metrics)?;
        Ok(Self {
            pipeline,
            tokens,
            admin,
        })
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {}", addr))?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("{} listening on {}", APP_NAME, listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            };
            let me = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let conn = http1::Builder::new().serve_connection(
                    io,
                    service_fn(move |req| {
                        let me = me.clone();
                        async move { me.handle(req).await }
                    }),
                );
                if let Err(e) = conn.await {
                    debug!(peer = %peer, "conn error: {e}");
                }
            });
        }
    }

    // Dropping this future (client gone) cancels the pipeline with it.
    async fn handle(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(self.respond(Request::from_parts(parts, body)).await)
    }

    /// Answer one buffered request, common headers included.
    pub async fn respond(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let (parts, body) = req.into_parts();

        let reply = self
            .dispatch(&parts.method, &parts.uri, &parts.headers, body)
            .await;
        let resp = finish(reply, &request_id, start);

        info!(
            request_id = %request_id,
            method = %parts.method,
            path = %parts.uri.path(),
            status = resp.status().as_u16(),
            latency_us = start.elapsed().as_micros() as u64,
            "request handled"
        );
        resp
    }

    async fn dispatch(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Reply {
        let matched = self.admin.at(uri.path()).ok().map(|m| {
            let tail = m.params.get("path").unwrap_or_default().to_string();
            (*m.value, tail)
        });

        let Some((route, tail)) = matched else {
            return self
                .proxy(method, uri, headers, body)
                .await
                .unwrap_or_else(Reply::from);
        };

        if route.method() != method {
            return Reply::new(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({ "error": "method not allowed" }),
            );
        }

        let registry = self.pipeline.registry();
        let result = match route {
            AdminRoute::Auth => admin::issue_token(self.tokens.as_ref()),
            AdminRoute::Add => admin::add_endpoint(registry, uri, headers, body).await,
            AdminRoute::Delete => admin::delete_endpoint(registry, &tail, uri.query()).await,
            AdminRoute::Metrics => admin::metrics(registry),
        };
        result.unwrap_or_else(Reply::from)
    }

    async fn proxy(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> ApyResult<Reply> {
        let req = ProxyRequest {
            method: method.clone(),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            // Non-ASCII credentials end up as an empty, malformed header.
            authorization: headers
                .get(AUTHORIZATION)
                .map(|v| v.to_str().unwrap_or_default().to_string()),
            content_type: headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        };
        let resp = self.pipeline.run(req).await?;
        Ok(Reply {
            status: StatusCode::OK,
            body: json!({ "body": resp.body }),
            cache_hit: resp.cache_hit,
        })
    }
}

fn finish(reply: Reply, request_id: &str, start: Instant) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&reply.body).unwrap_or_default();
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = reply.status;

    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(v) = HeaderValue::from_str(&server_name()) {
        headers.insert(SERVER, v);
    }
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", v);
    }
    headers.insert(
        "x-latency-us",
        HeaderValue::from(start.elapsed().as_micros() as u64),
    );
    if reply.cache_hit {
        headers.insert("x-cache", HeaderValue::from_static("HIT"));
    }
    resp
}
