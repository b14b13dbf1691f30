//! The request orchestrator: the top-level `tower::Service` that composes
//! the normalizer, pattern matcher, cache store, and render client into the
//! fresh/stale/render state machine and stamps the response headers.
//!
//! Shaped like a `Service` that wraps an inner handler and decides whether
//! to cache its output, except there is no inner handler to wrap: this
//! service *is* the terminal one, and its "inner call" is the render
//! client.

use crate::clock::Clock;
use crate::config::HostTable;
use crate::key::CacheKey;
use crate::normalize::{self, NormalizedUrl};
use crate::pattern::Action;
use crate::render::{RenderOutcome, RenderedResponse, Renderer};
use crate::store::{CacheStore, KvBackend, Lookup, Metadata};
use axum::body::Body;
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{info, warn, Instrument};

const HEADER_SOURCE: HeaderName = HeaderName::from_static("x-render-source");
const HEADER_CACHE: HeaderName = HeaderName::from_static("x-render-cache");
const HEADER_AGE: HeaderName = HeaderName::from_static("x-cache-age");

/// Everything the orchestrator needs, cloneable and shared across requests.
/// Generic over the KV backend and over the renderer so integration tests
/// can substitute a fake of each without touching Redis or the network.
pub struct OrchestratorService<K: KvBackend, R: Renderer> {
    hosts: Arc<HostTable>,
    store: CacheStore<K>,
    render: Arc<R>,
    clock: Arc<dyn Clock>,
}

// Manual impl: `CacheStore<K>` is `Clone` regardless of `K`, so a derived
// impl would wrongly require `K: Clone` (and `R: Clone`).
impl<K: KvBackend, R: Renderer> Clone for OrchestratorService<K, R> {
    fn clone(&self) -> Self {
        OrchestratorService {
            hosts: self.hosts.clone(),
            store: self.store.clone(),
            render: self.render.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<K: KvBackend, R: Renderer> OrchestratorService<K, R> {
    pub fn new(
        hosts: Arc<HostTable>,
        store: CacheStore<K>,
        render: Arc<R>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        OrchestratorService { hosts, store, render, clock }
    }
}

impl<K: KvBackend, R: Renderer> Service<Request<Body>> for OrchestratorService<K, R> {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let hosts = self.hosts.clone();
        let store = self.store.clone();
        let render = self.render.clone();
        let clock = self.clock.clone();

        let span = tracing::info_span!("request", host = tracing::field::Empty,
            key = tracing::field::Empty, action = tracing::field::Empty,
            cache_result = tracing::field::Empty);

        Box::pin(
            async move { Ok(handle(hosts, store, render, clock, req).await) }
                .instrument(span),
        )
    }
}

async fn handle<K: KvBackend, R: Renderer>(
    hosts: Arc<HostTable>,
    store: CacheStore<K>,
    render: Arc<R>,
    clock: Arc<dyn Clock>,
    req: Request<Body>,
) -> Response<Body> {
    let host_header = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let raw_url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let normalized = match normalize::normalize(&raw_url, &host_header, "https") {
        Ok(n) => n,
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "bad request"),
    };
    tracing::Span::current().record("host", &normalized.host());

    let host = match hosts.lookup(normalized.host()) {
        Ok(h) => h,
        Err(_) => {
            let mut resp = text_response(StatusCode::NOT_FOUND, "host not found");
            stamp(&mut resp, "bypass", None, None);
            return resp;
        }
    };

    let matched = crate::pattern::match_path(host, normalized.path());
    let action_name = format!("{:?}", matched.pattern.action);
    tracing::Span::current().record("action", &action_name.as_str());

    match matched.pattern.action {
        Action::Status(code) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
            status_response(status, &matched.pattern.headers)
        }
        Action::Bypass => {
            let mut resp = text_response(StatusCode::OK, "");
            stamp(&mut resp, "bypass", None, None);
            resp
        }
        Action::Render => {
            render_with_cache(host, matched.pattern, &normalized, &store, &render, &clock)
                .await
        }
    }
}

/// Picks the device dimension for a request. The classifier that maps a
/// `User-Agent` to a dimension name is a separate component out of scope
/// here; absent one, the host's first configured dimension is used.
fn select_dimension(host: &crate::config::HostConfig) -> &str {
    host.dimensions.keys().next().map(String::as_str).unwrap_or("default")
}

async fn render_with_cache<K: KvBackend, R: Renderer>(
    host: &crate::config::HostConfig,
    pattern: &crate::pattern::Pattern,
    url: &NormalizedUrl,
    store: &CacheStore<K>,
    render: &R,
    clock: &Arc<dyn Clock>,
) -> Response<Body> {
    let dimension = select_dimension(host);
    let key = CacheKey::derive(url, dimension);
    tracing::Span::current().record("key", &key.as_str());

    // A store error is not a cache miss: it must not trigger a write-back on
    // the next successful render, or a flapping store would alternate
    // between serving stale and overwriting it with whatever the renderer
    // last returned.
    let (stale_candidate, lookup_failed) = match store.lookup(&key, pattern.stale_ttl).await {
        Ok(Lookup::Fresh(meta, body)) => {
            tracing::Span::current().record("cache_result", "hit");
            let age = (clock.now() - meta.created_at).max(0) as u64;
            let mut resp = meta_response(&meta, body);
            stamp(&mut resp, "cache", Some("hit"), Some(age));
            return resp;
        }
        Ok(Lookup::Stale(meta, body)) => (Some((meta, body)), false),
        Ok(Lookup::None) => (None, false),
        Err(e) => {
            warn!(error = %e, "cache lookup failed, proceeding without cache");
            (None, true)
        }
    };

    let outcome = render
        .render(url, dimension, &host.render_key, host.default_timeout)
        .await;

    match outcome {
        RenderOutcome::Ok(rendered)
            if pattern.is_cacheable_status(rendered.status) && !lookup_failed =>
        {
            tracing::Span::current().record("cache_result", "new");
            let created_at = clock.now();
            let location = rendered.headers.get("location").cloned();
            let meta = Metadata::new(
                rendered.status,
                created_at,
                pattern.cache_ttl,
                rendered.headers.clone(),
                location,
            );
            if let Err(e) = store
                .write(&key, &meta, &rendered.body, pattern.cache_ttl, pattern.stale_ttl)
                .await
            {
                warn!(error = %e, "cache write failed after successful render");
            }
            let mut resp = rendered_response(&rendered);
            stamp(&mut resp, "rendered", Some("new"), None);
            resp
        }
        RenderOutcome::Ok(rendered) => {
            tracing::Span::current().record("cache_result", "miss");
            let mut resp = rendered_response(&rendered);
            stamp(&mut resp, "rendered", Some("miss"), None);
            resp
        }
        RenderOutcome::Failure(kind) => {
            if let Some((meta, body)) = stale_candidate {
                tracing::Span::current().record("cache_result", "stale");
                info!(failure = %kind, "render failed, serving stale");
                let age = (clock.now() - meta.created_at).max(0) as u64;
                let mut resp = meta_response(&meta, body);
                stamp(&mut resp, "cache", Some("stale"), Some(age));
                resp
            } else {
                tracing::Span::current().record("cache_result", "none");
                warn!(failure = %kind, "render failed with no stale fallback");
                let mut resp = text_response(StatusCode::BAD_GATEWAY, "render failed");
                stamp(&mut resp, "bypass", None, None);
                resp
            }
        }
    }
}

fn meta_response(meta: &Metadata, body: Vec<u8>) -> Response<Body> {
    let status = StatusCode::from_u16(meta.status_code).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &meta.headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
        {
            builder = builder.header(name, value);
        }
    }
    if let Some(location) = &meta.location {
        if let Ok(value) = HeaderValue::try_from(location.as_str()) {
            builder = builder.header(http::header::LOCATION, value);
        }
    }
    builder.body(Body::from(body)).unwrap_or_else(|_| {
        Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Body::empty()).unwrap()
    })
}

fn rendered_response(rendered: &RenderedResponse) -> Response<Body> {
    let status = StatusCode::from_u16(rendered.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &rendered.headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
        {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(rendered.body.clone()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap()
        })
}

/// Build a static `status_<code>` response, applying its pattern's
/// configured headers. Invalid header names/values are skipped rather than
/// failing the response, matching `meta_response`/`rendered_response`.
fn status_response(
    status: StatusCode,
    headers: &std::collections::HashMap<String, String>,
) -> Response<Body> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
        {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::empty()).unwrap_or_else(|_| {
        Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Body::empty()).unwrap()
    })
}

fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap()
        })
}

/// Stamp the three cache headers. `cache_state` and `age` are only present
/// on cache hits and stale responses.
fn stamp(resp: &mut Response<Body>, source: &str, cache_state: Option<&str>, age: Option<u64>) {
    resp.headers_mut().insert(HEADER_SOURCE, HeaderValue::from_str(source).unwrap());
    if let Some(state) = cache_state {
        resp.headers_mut().insert(HEADER_CACHE, HeaderValue::from_str(state).unwrap());
    }
    if let Some(age) = age {
        resp.headers_mut().insert(HEADER_AGE, HeaderValue::from_str(&age.to_string()).unwrap());
    }
}
