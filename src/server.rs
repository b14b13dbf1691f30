//! Binds the two HTTP listeners: the public-facing gateway and the internal
//! admin server, wiring together config, cache store, and render client.

use crate::admin::{self, AdminState};
use crate::clock::SystemClock;
use crate::config::{HostTable, RawConfig};
use crate::error::{Error, Result};
use crate::orchestrator::OrchestratorService;
use crate::render::{CompositeProbe, HealthProbe, RenderClient, TestHealthProbe};
use crate::store::blob::BlobStore;
use crate::store::redis::RedisKv;
use crate::store::CacheStore;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::timeout::TimeoutLayer;

/// Build both listeners and run until either one exits.
pub async fn run(raw: RawConfig, hosts: HostTable) -> Result<()> {
    let hosts = Arc::new(hosts);
    let clock = Arc::new(SystemClock);

    let kv = RedisKv::new(raw.redis.url.clone());
    let blob = BlobStore::new(raw.storage.base_path.clone());
    let store = CacheStore::new(kv, blob, clock.clone());

    let test_probe = Arc::new(TestHealthProbe::new());
    let circuit = Arc::new(crate::render::CircuitProbe::new(5));
    let probe: Arc<dyn HealthProbe> =
        Arc::new(CompositeProbe(vec![circuit, test_probe.clone()]));
    let render = Arc::new(RenderClient::new(render_base_url(), probe));

    let orchestrator = OrchestratorService::new(hosts, store.clone(), render, clock);

    let public_addr: SocketAddr = raw
        .server
        .listen
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid server.listen \"{}\"", raw.server.listen)))?;
    let internal_addr: SocketAddr = raw
        .internal
        .listen
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("invalid internal.listen \"{}\"", raw.internal.listen)))?;

    let public_app: Router = Router::new()
        .fallback_service(orchestrator)
        .layer(TimeoutLayer::new(raw.server.timeout));

    let admin_app = admin::router(AdminState {
        store,
        render_probe: test_probe,
        auth_key: Arc::new(raw.internal.auth_key.clone()),
    });

    let public_listener = tokio::net::TcpListener::bind(public_addr).await?;
    let internal_listener = tokio::net::TcpListener::bind(internal_addr).await?;

    tracing::info!(%public_addr, %internal_addr, "render-gatewayd listening");

    let public = axum::serve(public_listener, public_app.into_make_service());
    let internal = axum::serve(internal_listener, admin_app.into_make_service());

    tokio::select! {
        res = public => res.map_err(Error::Io)?,
        res = internal => res.map_err(Error::Io)?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

/// Where the upstream renderer lives. Out of scope to configure further —
/// this gateway talks to a single renderer endpoint per process.
fn render_base_url() -> String {
    std::env::var("RENDER_SERVICE_URL").unwrap_or_else(|_| "http://127.0.0.1:9000/render".to_string())
}
