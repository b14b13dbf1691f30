//! The internal admin listener: cache introspection and the time/failure
//! manipulation hooks used by integration tests, bound to `internal.listen`
//! and gated by a bearer-token check against `internal.auth_key`.

use crate::key::CacheKey;
use crate::render::TestHealthProbe;
use crate::store::{CacheStore, KvBackend};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

pub struct AdminState<K: KvBackend> {
    pub store: CacheStore<K>,
    pub render_probe: Arc<TestHealthProbe>,
    pub auth_key: Arc<String>,
}

// Manual impl: `CacheStore<K>` is `Clone` regardless of `K`, so a derived
// impl would wrongly require `K: Clone`.
impl<K: KvBackend> Clone for AdminState<K> {
    fn clone(&self) -> Self {
        AdminState {
            store: self.store.clone(),
            render_probe: self.render_probe.clone(),
            auth_key: self.auth_key.clone(),
        }
    }
}

pub fn router<K: KvBackend>(state: AdminState<K>) -> Router {
    let auth_key = state.auth_key.clone();
    Router::new()
        .route("/cache/:key/make-stale", post(make_stale::<K>))
        .route("/cache/:key", get(get_metadata::<K>))
        .route("/render/simulate-failure", post(simulate_failure::<K>))
        .with_state(state)
        .layer(middleware::from_fn(move |headers: HeaderMap, req, next: Next| {
            let auth_key = auth_key.clone();
            async move { require_bearer(&auth_key, &headers, req, next).await }
        }))
}

async fn require_bearer(
    auth_key: &str,
    headers: &HeaderMap,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let expected = format!("Bearer {auth_key}");
    match headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(got) if got == expected => next.run(req).await,
        _ => (StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response(),
    }
}

#[derive(Serialize)]
struct MetadataView {
    source: String,
    status_code: u16,
    created_at: i64,
    expires_at: i64,
    location: Option<String>,
}

async fn get_metadata<K: KvBackend>(
    State(state): State<AdminState<K>>,
    Path(key): Path<String>,
) -> Response {
    match state.store.metadata(&CacheKey::from_hex(key)).await {
        Ok(Some(meta)) => Json(MetadataView {
            source: meta.source,
            status_code: meta.status_code,
            created_at: meta.created_at,
            expires_at: meta.expires_at,
            location: meta.location,
        })
        .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn make_stale<K: KvBackend>(
    State(state): State<AdminState<K>>,
    Path(key): Path<String>,
) -> Response {
    match state.store.make_stale(&CacheKey::from_hex(key)).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

#[derive(serde::Deserialize)]
struct SimulateFailureBody {
    #[serde(default = "default_true")]
    fail: bool,
}

fn default_true() -> bool {
    true
}

async fn simulate_failure<K: KvBackend>(
    State(state): State<AdminState<K>>,
    body: Option<Json<SimulateFailureBody>>,
) -> Response {
    let fail = body.map(|Json(b)| b.fail).unwrap_or(true);
    state.render_probe.set_healthy(!fail);
    StatusCode::NO_CONTENT.into_response()
}
