//! The render client: calls the upstream HTML renderer for a (normalized
//! URL, dimension) pair and classifies the outcome into a cacheable
//! response or a typed failure.

use crate::error::RenderFailureKind;
use crate::normalize::NormalizedUrl;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A successful render: the upstream status, a flattened subset of
/// response headers worth replaying, and the body.
#[derive(Debug, Clone)]
pub struct RenderedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// The result of one render attempt.
pub enum RenderOutcome {
    Ok(RenderedResponse),
    Failure(RenderFailureKind),
}

/// Abstracts whether the renderer is currently considered healthy enough
/// to attempt a call at all. Production wires a real circuit check (e.g. a
/// recent-failure window); tests wire a plain toggle so failure scenarios
/// don't need a live unhealthy upstream.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn healthy(&self) -> bool;

    /// Feed back the outcome of an attempt. No-op for probes that don't
    /// track a rolling failure window.
    fn record_success(&self) {}
    fn record_failure(&self) {}
}

/// Always reports healthy — the default when no circuit breaker is wired.
pub struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn healthy(&self) -> bool {
        true
    }
}

/// Trips open after `threshold` consecutive failures and resets on the next
/// success. A minimal stand-in for a real circuit breaker.
pub struct CircuitProbe {
    consecutive_failures: std::sync::atomic::AtomicU32,
    threshold: u32,
}

impl CircuitProbe {
    pub fn new(threshold: u32) -> Self {
        CircuitProbe { consecutive_failures: std::sync::atomic::AtomicU32::new(0), threshold }
    }
}

#[async_trait]
impl HealthProbe for CircuitProbe {
    async fn healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) < self.threshold
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// A toggle a test can flip to force every subsequent render to fail with
/// [`RenderFailureKind::Transport`] without touching the network.
#[derive(Clone, Default)]
pub struct TestHealthProbe {
    healthy: Arc<AtomicBool>,
}

impl TestHealthProbe {
    pub fn new() -> Self {
        TestHealthProbe { healthy: Arc::new(AtomicBool::new(true)) }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for TestHealthProbe {
    async fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Combines several probes: healthy only if every one of them is, so that
/// an operator-forced toggle and a real circuit breaker can be wired
/// together without either one having to know about the other.
pub struct CompositeProbe(pub Vec<Arc<dyn HealthProbe>>);

#[async_trait]
impl HealthProbe for CompositeProbe {
    async fn healthy(&self) -> bool {
        for probe in &self.0 {
            if !probe.healthy().await {
                return false;
            }
        }
        true
    }

    fn record_success(&self) {
        for probe in &self.0 {
            probe.record_success();
        }
    }

    fn record_failure(&self) {
        for probe in &self.0 {
            probe.record_failure();
        }
    }
}

/// Invokes the upstream renderer for a (normalized URL, dimension) pair.
/// [`RenderClient`] is the production implementation; tests substitute a
/// fake that returns canned outcomes without touching the network.
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    async fn render(
        &self,
        url: &NormalizedUrl,
        dimension: &str,
        render_key: &str,
        timeout: Duration,
    ) -> RenderOutcome;
}

/// Calls the upstream renderer over HTTP. Holds one shared `reqwest::Client`
/// so connections are pooled across requests.
pub struct RenderClient {
    http: reqwest::Client,
    base_url: String,
    probe: Arc<dyn HealthProbe>,
}

impl RenderClient {
    pub fn new(base_url: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        RenderClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            probe,
        }
    }
}

#[async_trait]
impl Renderer for RenderClient {
    /// Invoke the renderer for `url` at `dimension`, authenticating with
    /// `render_key` and bounding the call with `timeout`.
    ///
    /// Does not retry: a single transport failure, 5xx, or unparseable
    /// response is reported immediately as a typed failure, leaving any
    /// retry policy to the orchestrator's stale fallback.
    async fn render(
        &self,
        url: &NormalizedUrl,
        dimension: &str,
        render_key: &str,
        timeout: Duration,
    ) -> RenderOutcome {
        if !self.probe.healthy().await {
            return RenderOutcome::Failure(RenderFailureKind::Transport);
        }

        let request = self
            .http
            .get(&self.base_url)
            .query(&[("url", url.as_str()), ("dimension", dimension)])
            .header("X-Render-Key", render_key)
            .timeout(timeout);

        let response = match request.send().await {
            Ok(r) => r,
            Err(_) => {
                self.probe.record_failure();
                return RenderOutcome::Failure(RenderFailureKind::Transport);
            }
        };

        let status = response.status().as_u16();
        if (500..600).contains(&status) {
            self.probe.record_failure();
            return RenderOutcome::Failure(RenderFailureKind::ServerError);
        }

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.to_string());
            }
        }

        let body = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(_) => {
                self.probe.record_failure();
                return RenderOutcome::Failure(RenderFailureKind::InvalidResponse);
            }
        };

        self.probe.record_success();
        RenderOutcome::Ok(RenderedResponse { status, headers, body })
    }
}
