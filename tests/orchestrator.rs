//! End-to-end exercises of [`OrchestratorService`] against an in-memory KV
//! backend, a temp-dir blob store, and a [`FakeRenderer`] standing in for
//! the network-calling render client.

use axum::body::Body;
use http::{Request, StatusCode};
use render_gateway::clock::TestClock;
use render_gateway::config::{Dimension, HostConfig, HostTable};
use render_gateway::normalize::NormalizedUrl;
use render_gateway::orchestrator::OrchestratorService;
use render_gateway::pattern::{Action, Pattern, StaleStrategy};
use render_gateway::render::{RenderOutcome, RenderedResponse, Renderer};
use render_gateway::error::{Error, Result};
use render_gateway::store::memory::MemoryKv;
use render_gateway::store::{BlobStore, CacheStore, KvBackend};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

/// A renderer whose outcomes are dictated by the test: a queue of canned
/// [`RenderOutcome`]s, consumed one per call, falling back to the last one
/// once exhausted.
struct FakeRenderer {
    outcomes: Mutex<Vec<RenderOutcome>>,
    calls: AtomicUsize,
}

impl FakeRenderer {
    fn new(outcomes: Vec<RenderOutcome>) -> Self {
        FakeRenderer { outcomes: Mutex::new(outcomes), calls: AtomicUsize::new(0) }
    }

    fn always(outcome: RenderOutcome) -> Self {
        FakeRenderer::new(vec![outcome])
    }
}

#[async_trait::async_trait]
impl Renderer for FakeRenderer {
    async fn render(
        &self,
        _url: &NormalizedUrl,
        _dimension: &str,
        _render_key: &str,
        _timeout: Duration,
    ) -> RenderOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.outcomes.lock().unwrap();
        if queue.len() > 1 {
            queue.remove(0)
        } else {
            clone_outcome(&queue[0])
        }
    }
}

fn clone_outcome(outcome: &RenderOutcome) -> RenderOutcome {
    match outcome {
        RenderOutcome::Ok(r) => RenderOutcome::Ok(r.clone()),
        RenderOutcome::Failure(k) => RenderOutcome::Failure(*k),
    }
}

fn rendered(status: u16, body: &[u8]) -> RenderOutcome {
    RenderOutcome::Ok(RenderedResponse {
        status,
        headers: HashMap::new(),
        body: body.to_vec(),
    })
}

fn redirect(location: &str) -> RenderOutcome {
    let mut headers = HashMap::new();
    headers.insert("location".to_string(), location.to_string());
    RenderOutcome::Ok(RenderedResponse { status: 301, headers, body: Vec::new() })
}

/// A `KvBackend` whose `hgetall` always errors, standing in for an
/// unreachable Redis instance.
struct FailingKv;

#[async_trait::async_trait]
impl KvBackend for FailingKv {
    async fn hset_all(&self, _key: &str, _fields: Vec<(String, String)>, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn hgetall(&self, _key: &str) -> Result<Option<HashMap<String, String>>> {
        Err(Error::StoreUnavailable("connection refused".to_string()))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn ttl_remaining(&self, _key: &str) -> Result<Option<Duration>> {
        Ok(None)
    }
}

/// A host with a single `render` pattern covering everything under
/// `/stale-test/`, `cache_ttl=2s stale_ttl=10s`, mirroring the concrete
/// scenarios.
fn host_table() -> HostTable {
    let render_pattern = Pattern::compile(
        "/stale-test/**".to_string(),
        Action::Render,
        Duration::from_secs(2),
        Duration::from_secs(10),
        StaleStrategy::ServeStale,
        vec![200, 301],
        HashMap::new(),
    )
    .unwrap();
    let default_action = Pattern::compile(
        "(default)".to_string(),
        Action::Bypass,
        Duration::from_secs(2),
        Duration::from_secs(10),
        StaleStrategy::ServeStale,
        vec![],
        HashMap::new(),
    )
    .unwrap();

    let mut dimensions = indexmap::IndexMap::new();
    dimensions.insert(
        "desktop".to_string(),
        Dimension { id: 1, width: 1280, height: 800, render_ua: "desktop-ua".to_string() },
    );

    let host = HostConfig {
        host_id: 1,
        domain: "example.com".to_string(),
        render_key: "secret-key".to_string(),
        default_timeout: Duration::from_secs(5),
        dimensions,
        patterns: vec![render_pattern],
        default_action,
    };

    HostTable::from_hosts(vec![host])
}

fn request(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(http::header::HOST, "example.com")
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(resp: http::Response<Body>) -> Vec<u8> {
    use http_body_util::BodyExt;
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

fn orchestrator(
    hosts: HostTable,
    clock: Arc<TestClock>,
    render: FakeRenderer,
) -> (OrchestratorService<MemoryKv, FakeRenderer>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let kv = MemoryKv::new();
    let blob = BlobStore::new(dir.path().to_path_buf());
    let clock_dyn: Arc<dyn render_gateway::clock::Clock> = clock.clone();
    let store = CacheStore::new(kv, blob, clock_dyn.clone());
    let svc = OrchestratorService::new(Arc::new(hosts), store, Arc::new(render), clock_dyn);
    (svc, dir)
}

fn header<'a>(resp: &'a http::Response<Body>, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn send(
    svc: &mut OrchestratorService<MemoryKv, FakeRenderer>,
    path: &str,
) -> http::Response<Body> {
    svc.ready().await.unwrap().call(request(path)).await.unwrap()
}

#[tokio::test]
async fn fresh_then_hit() {
    let clock = Arc::new(TestClock::new(1_000));
    let (mut svc, _dir) = orchestrator(host_table(), clock, FakeRenderer::always(rendered(200, b"rendered body")));

    let first = send(&mut svc, "/stale-test/default-fresh.html").await;
    assert_eq!(header(&first, "x-render-source"), Some("rendered"));
    let first_body = body_bytes(first).await;
    assert_eq!(first_body, b"rendered body");

    let second = send(&mut svc, "/stale-test/default-fresh.html").await;
    assert_eq!(header(&second, "x-render-source"), Some("cache"));
    assert_eq!(header(&second, "x-render-cache"), Some("hit"));
    let second_body = body_bytes(second).await;
    assert_eq!(second_body, first_body);
}

#[tokio::test]
async fn stale_on_transport_failure() {
    use render_gateway::error::RenderFailureKind;

    let clock = Arc::new(TestClock::new(1_000));
    let render = FakeRenderer::new(vec![
        rendered(200, b"first body"),
        RenderOutcome::Failure(RenderFailureKind::Transport),
    ]);
    let (mut svc, _dir) = orchestrator(host_table(), clock.clone(), render);

    let first = send(&mut svc, "/stale-test/default").await;
    let first_body = body_bytes(first).await;

    clock.advance(3);
    let second = send(&mut svc, "/stale-test/default").await;
    assert_eq!(header(&second, "x-render-source"), Some("cache"));
    assert_eq!(header(&second, "x-render-cache"), Some("stale"));
    let second_body = body_bytes(second).await;
    assert_eq!(second_body, first_body);
}

#[tokio::test]
async fn stale_on_server_error() {
    let clock = Arc::new(TestClock::new(1_000));
    let render = FakeRenderer::new(vec![rendered(200, b"first body"), rendered(500, b"ignored")]);
    let (mut svc, _dir) = orchestrator(host_table(), clock.clone(), render);

    let first = send(&mut svc, "/stale-test/default").await;
    let first_body = body_bytes(first).await;

    clock.advance(3);
    let second = send(&mut svc, "/stale-test/default").await;
    assert_eq!(header(&second, "x-render-cache"), Some("stale"));
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_bytes(second).await, first_body);
}

#[tokio::test]
async fn fresh_overwrites_stale() {
    let clock = Arc::new(TestClock::new(1_000));
    let render = FakeRenderer::new(vec![rendered(200, b"first body"), rendered(200, b"second body")]);
    let (mut svc, _dir) = orchestrator(host_table(), clock.clone(), render);

    let _ = send(&mut svc, "/stale-test/default").await;
    clock.advance(3);
    let second = send(&mut svc, "/stale-test/default").await;
    assert_eq!(header(&second, "x-render-source"), Some("rendered"));
    assert_eq!(header(&second, "x-render-cache"), Some("new"));
    assert_eq!(body_bytes(second).await, b"second body");
}

#[tokio::test]
async fn fully_expired_bypasses_on_renderer_failure() {
    use render_gateway::error::RenderFailureKind;

    let clock = Arc::new(TestClock::new(1_000));
    let render = FakeRenderer::new(vec![
        rendered(200, b"first body"),
        RenderOutcome::Failure(RenderFailureKind::Transport),
    ]);
    let (mut svc, _dir) = orchestrator(host_table(), clock.clone(), render);

    let _ = send(&mut svc, "/stale-test/default").await;
    clock.advance(13);
    let second = send(&mut svc, "/stale-test/default").await;
    assert_eq!(second.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(header(&second, "x-render-source"), Some("bypass"));
}

#[tokio::test]
async fn redirect_is_cached_and_replayed_stale() {
    let clock = Arc::new(TestClock::new(1_000));
    let render = FakeRenderer::new(vec![redirect("/elsewhere"), rendered(500, b"ignored")]);
    let (mut svc, _dir) = orchestrator(host_table(), clock.clone(), render);

    let first = send(&mut svc, "/stale-test/redirect").await;
    assert_eq!(first.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(header(&first, "location"), Some("/elsewhere"));

    clock.advance(3);
    let second = send(&mut svc, "/stale-test/redirect").await;
    assert_eq!(second.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(header(&second, "location"), Some("/elsewhere"));
    assert_eq!(header(&second, "x-render-cache"), Some("stale"));
}

#[tokio::test]
async fn query_reorder_hits_same_cache_entry() {
    let clock = Arc::new(TestClock::new(1_000));
    let render = FakeRenderer::always(rendered(200, b"body"));
    let (mut svc, _dir) = orchestrator(host_table(), clock, render);

    let first = send(&mut svc, "/stale-test/page?z=3&a=1&m=2").await;
    assert_eq!(header(&first, "x-render-source"), Some("rendered"));

    let second = send(&mut svc, "/stale-test/page?a=1&m=2&z=3").await;
    assert_eq!(header(&second, "x-render-source"), Some("cache"));
    assert_eq!(header(&second, "x-render-cache"), Some("hit"));
}

#[tokio::test]
async fn age_header_is_monotonic_across_two_hits() {
    let clock = Arc::new(TestClock::new(1_000));
    let render = FakeRenderer::always(rendered(200, b"body"));
    let (mut svc, _dir) = orchestrator(host_table(), clock.clone(), render);

    let _ = send(&mut svc, "/stale-test/age").await;
    let first_hit = send(&mut svc, "/stale-test/age").await;
    let first_age: u64 = header(&first_hit, "x-cache-age").unwrap().parse().unwrap();

    clock.advance(1);
    let second_hit = send(&mut svc, "/stale-test/age").await;
    let second_age: u64 = header(&second_hit, "x-cache-age").unwrap().parse().unwrap();

    assert!(second_age >= first_age);
}

#[tokio::test]
async fn unknown_host_is_404_bypass() {
    let clock = Arc::new(TestClock::new(1_000));
    let (mut svc, _dir) = orchestrator(host_table(), clock, FakeRenderer::always(rendered(200, b"x")));

    let req = Request::builder()
        .uri("/stale-test/default")
        .header(http::header::HOST, "unknown.example")
        .body(Body::empty())
        .unwrap();
    let resp = svc.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&resp, "x-render-source"), Some("bypass"));
}

#[tokio::test]
async fn non_cacheable_status_is_never_written() {
    let clock = Arc::new(TestClock::new(1_000));
    let render = FakeRenderer::always(rendered(404, b"nope"));
    let (mut svc, _dir) = orchestrator(host_table(), clock, render);

    let resp = send(&mut svc, "/stale-test/missing").await;
    assert_eq!(header(&resp, "x-render-cache"), Some("miss"));
}

/// A lookup that errors must not be treated as a miss: the successful render
/// that follows must not be written back, or a flapping store would
/// alternate between serving stale garbage and overwriting it on every
/// request that happens to catch the store healthy again.
#[tokio::test]
async fn store_lookup_error_suppresses_write_back() {
    let clock = Arc::new(TestClock::new(1_000));
    let dir = tempfile::tempdir().unwrap();
    let blob_for_store = BlobStore::new(dir.path().to_path_buf());
    let blob_for_check = BlobStore::new(dir.path().to_path_buf());
    let clock_dyn: Arc<dyn render_gateway::clock::Clock> = clock.clone();
    let store = CacheStore::new(FailingKv, blob_for_store, clock_dyn.clone());
    let render = FakeRenderer::always(rendered(200, b"rendered body"));
    let mut svc =
        OrchestratorService::new(Arc::new(host_table()), store, Arc::new(render), clock_dyn);

    let resp = send(&mut svc, "/stale-test/default-fresh.html").await;
    assert_eq!(header(&resp, "x-render-source"), Some("rendered"));
    assert_eq!(header(&resp, "x-render-cache"), Some("miss"));

    let url = render_gateway::normalize::normalize(
        "/stale-test/default-fresh.html",
        "example.com",
        "https",
    )
    .unwrap();
    let key = render_gateway::key::CacheKey::derive(&url, "desktop");
    assert!(!blob_for_check.exists(key.as_str()).await);
}

#[tokio::test]
async fn status_action_applies_configured_headers() {
    let render_pattern = Pattern::compile(
        "/stale-test/**".to_string(),
        Action::Render,
        Duration::from_secs(2),
        Duration::from_secs(10),
        StaleStrategy::ServeStale,
        vec![200, 301],
        HashMap::new(),
    )
    .unwrap();
    let mut status_headers = HashMap::new();
    status_headers.insert("x-blocked-reason".to_string(), "maintenance".to_string());
    let status_pattern = Pattern::compile(
        "/blocked/**".to_string(),
        Action::Status(503),
        Duration::from_secs(2),
        Duration::from_secs(10),
        StaleStrategy::ServeStale,
        vec![],
        status_headers,
    )
    .unwrap();
    let default_action = Pattern::compile(
        "(default)".to_string(),
        Action::Bypass,
        Duration::from_secs(2),
        Duration::from_secs(10),
        StaleStrategy::ServeStale,
        vec![],
        HashMap::new(),
    )
    .unwrap();

    let mut dimensions = indexmap::IndexMap::new();
    dimensions.insert(
        "desktop".to_string(),
        Dimension { id: 1, width: 1280, height: 800, render_ua: "desktop-ua".to_string() },
    );
    let host = HostConfig {
        host_id: 1,
        domain: "example.com".to_string(),
        render_key: "secret-key".to_string(),
        default_timeout: Duration::from_secs(5),
        dimensions,
        patterns: vec![render_pattern, status_pattern],
        default_action,
    };
    let hosts = HostTable::from_hosts(vec![host]);

    let clock = Arc::new(TestClock::new(1_000));
    let (mut svc, _dir) =
        orchestrator(hosts, clock, FakeRenderer::always(rendered(200, b"unused")));

    let resp = send(&mut svc, "/blocked/page").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(header(&resp, "x-blocked-reason"), Some("maintenance"));
}
