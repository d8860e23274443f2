use apy_core::{
    ApyResult, ForwardRequest, HttpForwarder, ManualClock, Pipeline, RateLimiter, Registry,
    Upstream, UpstreamResponse,
};
use apy_crypto::{JwtAuthority, TokenAuthority};
use apy_gateway::Gateway;
use apy_memory::Memory;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

const WINDOW: u64 = 54_000;

/// Records every forwarded request and answers with a fixed body.
struct RecordingUpstream {
    body: String,
    seen: Mutex<Vec<ForwardRequest>>,
}

impl RecordingUpstream {
    fn calls(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Upstream for RecordingUpstream {
    async fn forward(&self, req: ForwardRequest) -> ApyResult<UpstreamResponse> {
        self.seen.lock().unwrap().push(req);
        Ok(UpstreamResponse {
            status: 200,
            body: self.body.clone(),
        })
    }
}

struct Fixture {
    gateway: Gateway,
    clock: Arc<ManualClock>,
    tokens: Arc<JwtAuthority>,
    upstream: Arc<RecordingUpstream>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(Registry::new(
        Arc::new(Memory::memory()),
        Duration::from_secs(1),
    ));
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let tokens = Arc::new(JwtAuthority::new("gateway-test", 900));
    let upstream = Arc::new(RecordingUpstream {
        body: r#"{"users":[1,2]}"#.into(),
        seen: Mutex::new(Vec::new()),
    });
    let pipeline = Arc::new(Pipeline::new(
        registry,
        RateLimiter::new(Duration::from_secs(WINDOW), clock.clone()),
        tokens.clone(),
        upstream.clone(),
    ));
    Fixture {
        gateway: Gateway::new(pipeline, tokens.clone()).unwrap(),
        clock,
        tokens,
        upstream,
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    json: Value,
}

async fn call(gw: &Gateway, method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> Reply {
    let mut req = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
        req = req.header(*k, *v);
    }
    let resp = gw
        .respond(req.body(Bytes::from(body.to_string())).unwrap())
        .await;
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    Reply {
        status,
        headers,
        json: serde_json::from_slice(&bytes).unwrap(),
    }
}

async fn get(gw: &Gateway, uri: &str) -> Reply {
    call(gw, Method::GET, uri, &[], "").await
}

async fn add(gw: &Gateway, form: &str) -> Reply {
    call(
        gw,
        Method::POST,
        "/add",
        &[("content-type", "application/x-www-form-urlencoded")],
        form,
    )
    .await
}

#[tokio::test]
async fn auth_issues_bearer_tokens_with_common_headers() {
    let f = fixture();
    let r = get(&f.gateway, "/auth").await;

    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.json["type"], "Bearer");
    assert!(r.json["expires"].as_i64().unwrap() > unix_now());
    let token = r.json["token"].as_str().unwrap();
    assert_eq!(f.tokens.validate(token), apy_crypto::TokenStatus::Valid);

    assert_eq!(r.headers["content-type"], "application/json");
    assert!(r.headers["server"].to_str().unwrap().contains('/'));
    assert_eq!(r.headers["x-request-id"].len(), 36);
    assert!(r.headers.contains_key("x-latency-us"));
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::test]
async fn added_endpoint_proxies_and_shows_in_metrics() {
    let f = fixture();
    let created = add(
        &f.gateway,
        "name=users&url=https%3A%2F%2Freqres.in%2Fapi%2Fusers&method=get",
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let path = created.json["path"].as_str().unwrap().to_string();
    assert_eq!(path.len(), 9);

    let proxied = get(&f.gateway, &format!("{path}?page=2")).await;
    assert_eq!(proxied.status, StatusCode::OK);
    assert_eq!(proxied.json["body"], r#"{"users":[1,2]}"#);
    assert!(!proxied.headers.contains_key("x-cache"));

    {
        let seen = f.upstream.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://reqres.in/api/users");
        assert_eq!(seen[0].query.as_deref(), Some("page=2"));
    }

    let metrics = get(&f.gateway, "/metrics").await;
    assert_eq!(metrics.status, StatusCode::OK);
    assert_eq!(metrics.json["users"]["path"], path.as_str());
    assert_eq!(metrics.json["users"]["method"], "GET");
    assert_eq!(metrics.json["users"]["url"], "https://reqres.in/api/users");
    assert_eq!(metrics.json["users"]["requests"], 1);
}

#[tokio::test]
async fn multipart_registration_with_custom_path() {
    let f = fixture();
    let body = [
        ("name", "orders"),
        ("url", "http://orders.internal/v1"),
        ("method", "POST"),
        ("path", "orders"),
    ]
    .iter()
    .map(|(k, v)| {
        format!("--XYZ\r\nContent-Disposition: form-data; name=\"{k}\"\r\n\r\n{v}\r\n")
    })
    .collect::<String>()
        + "--XYZ--\r\n";

    let r = call(
        &f.gateway,
        Method::POST,
        "/add",
        &[("content-type", "multipart/form-data; boundary=XYZ")],
        &body,
    )
    .await;
    assert_eq!(r.status, StatusCode::CREATED);
    assert_eq!(r.json["path"], "/orders");

    let proxied = call(&f.gateway, Method::POST, "/orders", &[], "{}").await;
    assert_eq!(proxied.status, StatusCode::OK);
    assert_eq!(get(&f.gateway, "/orders").await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_forms_report_field_errors() {
    let f = fixture();
    let empty = add(&f.gateway, "").await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
    assert_eq!(empty.json["error"], "invalid endpoint form");
    assert_eq!(empty.json["fields"]["name"], "Name cannot be empty.");
    assert!(empty.json["fields"]["url"].is_string());
    assert!(empty.json["fields"]["method"].is_string());

    let patch = add(&f.gateway, "name=n&url=http%3A%2F%2Fup&method=PATCH").await;
    assert_eq!(patch.json["fields"]["method"], "Method not allowed.");
    assert!(patch.json["fields"].get("name").is_none());

    let reserved = add(&f.gateway, "name=n&url=http%3A%2F%2Fup&method=GET&path=metrics").await;
    assert_eq!(reserved.status, StatusCode::BAD_REQUEST);
    assert!(reserved.json["fields"]["path"].is_string());

    let shadowed = add(&f.gateway, "name=n&url=http%3A%2F%2Fup&method=GET&path=delete%2Ffoo").await;
    assert_eq!(shadowed.status, StatusCode::BAD_REQUEST);
    assert_eq!(shadowed.json["fields"]["path"], "Path is reserved.");

    let broken = call(
        &f.gateway,
        Method::POST,
        "/add",
        &[("content-type", "multipart/form-data")],
        "junk",
    )
    .await;
    assert_eq!(broken.status, StatusCode::BAD_REQUEST);

    assert_eq!(get(&f.gateway, "/metrics").await.json, serde_json::json!({}));
}

#[tokio::test]
async fn rate_limited_endpoint_recovers_after_window() {
    let f = fixture();
    add(
        &f.gateway,
        "name=lim&url=http%3A%2F%2Fup&method=GET&path=lim&rate-limit=2",
    )
    .await;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        statuses.push(get(&f.gateway, "/lim").await.status.as_u16());
    }
    assert_eq!(statuses, vec![200, 200, 429]);
    assert_eq!(
        get(&f.gateway, "/lim").await.json["error"],
        "too many requests"
    );

    f.clock.advance(WINDOW as i64);
    assert_eq!(get(&f.gateway, "/lim").await.status, StatusCode::OK);
    assert_eq!(get(&f.gateway, "/metrics").await.json["lim"]["requests"], 3);
}

#[tokio::test]
async fn cached_endpoint_calls_upstream_once() {
    let f = fixture();
    add(
        &f.gateway,
        "name=c&url=http%3A%2F%2Fup&method=GET&path=c&enable-cache=on",
    )
    .await;

    let first = get(&f.gateway, "/c").await;
    let second = get(&f.gateway, "/c").await;
    assert_eq!(first.json, second.json);
    assert_eq!(second.headers["x-cache"], "HIT");
    assert_eq!(f.upstream.calls(), 1);
}

#[tokio::test]
async fn auth_enabled_endpoint_requires_bearer_token() {
    let f = fixture();
    add(
        &f.gateway,
        "name=s&url=http%3A%2F%2Fup&method=GET&path=secure&enable-auth=true",
    )
    .await;

    let missing = get(&f.gateway, "/secure").await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing.json["error"], "missing token");

    let bare = call(&f.gateway, Method::GET, "/secure", &[("authorization", "Bearer")], "").await;
    assert_eq!(bare.status, StatusCode::BAD_REQUEST);

    let bogus = call(
        &f.gateway,
        Method::GET,
        "/secure",
        &[("authorization", "Bearer nope")],
        "",
    )
    .await;
    assert_eq!(bogus.status, StatusCode::UNAUTHORIZED);

    let token = get(&f.gateway, "/auth").await.json["token"]
        .as_str()
        .unwrap()
        .to_string();
    let ok = call(
        &f.gateway,
        Method::GET,
        "/secure",
        &[("authorization", &format!("Bearer {token}"))],
        "",
    )
    .await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(get(&f.gateway, "/metrics").await.json["s"]["requests"], 1);
}

#[tokio::test]
async fn delete_removes_routes() {
    let f = fixture();
    add(&f.gateway, "name=a&url=http%3A%2F%2Fup&method=GET&path=d").await;
    add(&f.gateway, "name=b&url=http%3A%2F%2Fup&method=POST&path=d").await;

    let one = call(&f.gateway, Method::DELETE, "/delete/d?method=post", &[], "").await;
    assert_eq!(one.status, StatusCode::OK);
    assert_eq!(one.json["path"], "/d");
    assert_eq!(
        call(&f.gateway, Method::POST, "/d", &[], "").await.status,
        StatusCode::NOT_FOUND
    );
    assert_eq!(get(&f.gateway, "/d").await.status, StatusCode::OK);

    let rest = call(&f.gateway, Method::DELETE, "/delete/d", &[], "").await;
    assert_eq!(rest.status, StatusCode::OK);
    assert_eq!(get(&f.gateway, "/d").await.status, StatusCode::NOT_FOUND);

    let again = call(&f.gateway, Method::DELETE, "/delete/d", &[], "").await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    assert!(again.json["error"].is_string());
}

#[tokio::test]
async fn admin_routes_reject_other_methods() {
    let f = fixture();
    let r = call(&f.gateway, Method::POST, "/metrics", &[], "").await;
    assert_eq!(r.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(get(&f.gateway, "/add").await.status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let f = fixture();
    let r = get(&f.gateway, "/nowhere").await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
    assert_eq!(r.json["error"], "endpoint not found");
    assert_eq!(r.headers["content-type"], "application/json");
}

async fn spawn_upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let hits = hits.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let body = format!(
                            "{} {}",
                            req.method(),
                            req.uri().query().unwrap_or_default()
                        );
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn end_to_end_over_sockets() {
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream_addr = spawn_upstream(hits.clone()).await;

    let registry = Arc::new(Registry::new(
        Arc::new(Memory::memory()),
        Duration::from_secs(1),
    ));
    let tokens: Arc<dyn TokenAuthority> = Arc::new(JwtAuthority::new("e2e", 900));
    let pipeline = Arc::new(Pipeline::new(
        registry,
        RateLimiter::new(Duration::from_secs(WINDOW), Arc::new(ManualClock::new(0))),
        tokens.clone(),
        Arc::new(HttpForwarder::new(Duration::from_secs(5), "Apy/test").unwrap()),
    ));
    let gateway = Arc::new(Gateway::new(pipeline, tokens).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gw_addr = listener.local_addr().unwrap();
    tokio::spawn(gateway.serve_listener(listener));

    let target = format!("http://{upstream_addr}/echo");
    let client = reqwest::Client::new();
    let created = client
        .post(format!("http://{gw_addr}/add"))
        .form(&[
            ("name", "echo"),
            ("url", target.as_str()),
            ("method", "GET"),
            ("path", "echo"),
            ("enable-cache", "on"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);

    for _ in 0..2 {
        let resp = client
            .get(format!("http://{gw_addr}/echo?x=1"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["body"], "GET x=1");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
