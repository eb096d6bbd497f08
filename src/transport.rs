//! Authenticates, serializes and sends a single batch to the ingestion endpoint.
//!
//! Response classification follows the same status-code table as New Relic's telemetry SDK
//! client (`process_response`): 2xx and 207 are handled inline, the 4xx family that is never
//! worth retrying maps to [`TransportError::Rejected`], 429/5xx map to
//! [`TransportError::Transient`] with a `Retry-After` hint extracted when present, and anything
//! else falls back to a retryable `Transient` so an unexpected status does not wedge the client.

use crate::ingest_error::{IngestionEventError, TransportError};
use crate::model::{Batch, IngestionResponse};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Body of a successful `/health` probe.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Capability seam so the batch processor can be tested against an in-process double instead of
/// a real HTTP server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_batch(&self, batch: &Batch) -> Result<IngestionResponse, TransportError>;

    /// Probe service liveness. Transports that have no such endpoint can leave this unimplemented.
    async fn health(&self) -> Result<HealthStatus, TransportError> {
        Err(TransportError::Decode("health check not supported by this transport".into()))
    }
}

/// Whether a hook failure aborts the request or is recovered, logged and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookClass {
    Critical,
    Observational,
}

/// Runs before the request is sent; can mutate headers (auth, tracing ids) or reject the request
/// outright when `class` is [`HookClass::Critical`].
pub struct BeforeHook {
    name: &'static str,
    class: HookClass,
    run: Arc<dyn Fn(&mut reqwest::Request) -> Result<(), TransportError> + Send + Sync>,
}

impl BeforeHook {
    pub fn new(
        name: &'static str,
        class: HookClass,
        run: impl Fn(&mut reqwest::Request) -> Result<(), TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self { name, class, run: Arc::new(run) }
    }
}

/// Observes the outcome of a completed (or failed) send; always recovered regardless of `class`
/// since by the time it runs the request has already happened.
pub struct AfterHook {
    name: &'static str,
    class: HookClass,
    run: Arc<dyn Fn(&HookContext<'_>) + Send + Sync>,
}

impl AfterHook {
    pub fn new(name: &'static str, class: HookClass, run: impl Fn(&HookContext<'_>) + Send + Sync + 'static) -> Self {
        Self { name, class, run: Arc::new(run) }
    }
}

/// Snapshot passed to every [`AfterHook`].
pub struct HookContext<'a> {
    pub status: Option<u16>,
    pub duration: Duration,
    pub error: Option<&'a TransportError>,
}

/// Running per-status-class counters and a duration running-sum, the lightweight in-process
/// stand-in for a full histogram.
#[derive(Default)]
pub struct TransportMetrics {
    count_2xx: AtomicU64,
    count_4xx: AtomicU64,
    count_5xx: AtomicU64,
    count_network_error: AtomicU64,
    duration_count: AtomicU64,
    duration_sum_millis: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportMetricsSnapshot {
    pub count_2xx: u64,
    pub count_4xx: u64,
    pub count_5xx: u64,
    pub count_network_error: u64,
    pub mean_duration_millis: f64,
}

impl TransportMetrics {
    fn record_status(&self, status: u16) {
        match status {
            200..=299 => self.count_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.count_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.count_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    fn record_network_error(&self) {
        self.count_network_error.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duration(&self, duration: Duration) {
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_millis.fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportMetricsSnapshot {
        let count = self.duration_count.load(Ordering::Relaxed);
        let sum = self.duration_sum_millis.load(Ordering::Relaxed);
        TransportMetricsSnapshot {
            count_2xx: self.count_2xx.load(Ordering::Relaxed),
            count_4xx: self.count_4xx.load(Ordering::Relaxed),
            count_5xx: self.count_5xx.load(Ordering::Relaxed),
            count_network_error: self.count_network_error.load(Ordering::Relaxed),
            mean_duration_millis: if count == 0 { 0.0 } else { sum as f64 / count as f64 },
        }
    }
}

/// HTTP-backed [`Transport`]: basic-auth POST of a JSON batch with a before/after hook chain.
pub struct HTTPTransport {
    client: reqwest::Client,
    endpoint: String,
    public_key: String,
    secret_key: String,
    user_agent: String,
    before_hooks: Vec<BeforeHook>,
    after_hooks: Vec<AfterHook>,
    metrics: TransportMetrics,
}

impl HTTPTransport {
    pub fn builder(base_url: impl Into<String>, public_key: impl Into<String>, secret_key: impl Into<String>) -> HTTPTransportBuilder {
        HTTPTransportBuilder::new(base_url, public_key, secret_key)
    }

    pub fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn run_before_hooks(&self, request: &mut reqwest::Request) -> Result<(), TransportError> {
        for hook in &self.before_hooks {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (hook.run)(request)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) if hook.class == HookClass::Critical => {
                    tracing::error!(hook = hook.name, error = %err, "critical before-hook aborted request");
                    return Err(err);
                }
                Ok(Err(err)) => {
                    tracing::warn!(hook = hook.name, error = %err, "observational before-hook failed");
                }
                Err(_) if hook.class == HookClass::Critical => {
                    let err = TransportError::Decode(format!("critical hook `{}` panicked", hook.name));
                    tracing::error!(hook = hook.name, "critical before-hook panicked");
                    return Err(err);
                }
                Err(_) => {
                    tracing::warn!(hook = hook.name, "observational before-hook panicked");
                }
            }
        }
        Ok(())
    }

    fn run_after_hooks(&self, ctx: &HookContext<'_>) {
        for hook in self.after_hooks.iter().rev() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (hook.run)(ctx)));
            if outcome.is_err() {
                let level = if hook.class == HookClass::Critical { "critical" } else { "observational" };
                tracing::warn!(hook = hook.name, class = level, "after-hook panicked, recovered");
            }
        }
    }

    async fn post_batch(&self, body: Vec<u8>) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .client
            .post(format!("{}/ingestion", self.endpoint))
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .body(body)
            .build()
            .map_err(TransportError::Network)?;

        self.run_before_hooks(&mut request)?;
        self.client.execute(request).await.map_err(TransportError::Network)
    }
}

#[async_trait]
impl Transport for HTTPTransport {
    async fn send_batch(&self, batch: &Batch) -> Result<IngestionResponse, TransportError> {
        let body = serde_json::to_vec(batch)?;
        let start = Instant::now();

        let outcome = self.post_batch(body).await;
        let duration = start.elapsed();
        self.metrics.record_duration(duration);

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                self.metrics.record_network_error();
                self.run_after_hooks(&HookContext { status: None, duration, error: Some(&err) });
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        self.metrics.record_status(status);

        let result = classify_response(status, response).await;
        self.run_after_hooks(&HookContext { status: Some(status), duration, error: result.as_ref().err() });
        result
    }

    async fn health(&self) -> Result<HealthStatus, TransportError> {
        let response = self
            .client
            .get(format!("{}/health", self.endpoint))
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(TransportError::Network)?;
        let body = response.text().await.map_err(TransportError::Network)?;
        serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

async fn classify_response(status: u16, response: reqwest::Response) -> Result<IngestionResponse, TransportError> {
    match status {
        200..=299 => Ok(IngestionResponse::default()),
        207 => {
            let body = response.text().await.map_err(TransportError::Network)?;
            let parsed: IngestionResponse =
                serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))?;
            if parsed.errors.is_empty() {
                Ok(parsed)
            } else {
                let failure_count = parsed.errors.len();
                let total = failure_count + parsed.successes.len();
                let errors = parsed
                    .errors
                    .iter()
                    .map(|e| IngestionEventError {
                        id: e.id.clone(),
                        status: e.status,
                        message: e.message.clone().unwrap_or_else(|| "unknown error".into()),
                    })
                    .collect();
                Err(TransportError::PartialFailure { total, failure_count, errors })
            }
        }
        400 | 404 | 405 | 409 | 410 | 411 => {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Rejected { status, body })
        }
        401 | 403 => {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Rejected { status, body })
        }
        429 => {
            let retry_after = extract_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Transient { status, body, retry_after })
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Transient { status, body, retry_after: None })
        }
    }
}

fn extract_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.parse::<u64>().ok().map(Duration::from_secs)
}

/// Builds an [`HTTPTransport`], mirroring the fluent `ClientBuilder` shape used elsewhere in the
/// ecosystem for HTTP client configuration.
pub struct HTTPTransportBuilder {
    base_url: String,
    public_key: String,
    secret_key: String,
    timeout: Duration,
    // Accepted and cross-validated against `max_idle_conns_per_host` at the config layer, but
    // `build()` has no way to apply it: reqwest exposes no total-pool-size knob.
    #[allow(dead_code)]
    max_idle_conns: usize,
    max_idle_conns_per_host: usize,
    before_hooks: Vec<BeforeHook>,
    after_hooks: Vec<AfterHook>,
}

impl HTTPTransportBuilder {
    fn new(base_url: impl Into<String>, public_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            public_key: public_key.into(),
            secret_key: secret_key.into(),
            timeout: Duration::from_secs(10),
            max_idle_conns: 100,
            max_idle_conns_per_host: 10,
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_idle_conns(mut self, max: usize) -> Self {
        self.max_idle_conns = max;
        self
    }

    pub fn max_idle_conns_per_host(mut self, max: usize) -> Self {
        self.max_idle_conns_per_host = max;
        self
    }

    pub fn before_hook(mut self, hook: BeforeHook) -> Self {
        self.before_hooks.push(hook);
        self
    }

    pub fn after_hook(mut self, hook: AfterHook) -> Self {
        self.after_hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<HTTPTransport, TransportError> {
        // reqwest's pool is configured per-host only (`pool_max_idle_per_host`); it has no
        // knob for a total-pool-size cap, so `max_idle_conns` cannot be applied here. It is
        // still validated against `max_idle_conns_per_host` at the config layer (a total bound
        // smaller than the per-host bound is nonsensical) and surfaced on `Config` as a
        // documented limitation rather than silently accepted and dropped.
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(self.max_idle_conns_per_host)
            .build()
            .map_err(TransportError::Network)?;

        Ok(HTTPTransport {
            client,
            endpoint: self.base_url,
            public_key: self.public_key,
            secret_key: self.secret_key,
            user_agent: format!("langfuse-core/{}", env!("CARGO_PKG_VERSION")),
            before_hooks: self.before_hooks,
            after_hooks: self.after_hooks,
            metrics: TransportMetrics::default(),
        })
    }
}
