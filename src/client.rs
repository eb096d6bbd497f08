//! The client facade: wires config, transport, the resilience guard stack, the event queue, the
//! batch processor, and the lifecycle manager into the single object application code holds.
//!
//! Construction mirrors the teacher's resilience-stack builder: each component is built
//! independently and handed to the next, outermost-last. Runtime shape is the same "policies
//! wrap an operation" style, but at the level of whole subsystems instead of a single closure:
//! `EventQueue` feeds `BatchProcessor` which calls `GuardStack::execute` which calls
//! `HTTPTransport::send_batch`.

use crate::batch_processor::{AsyncErrorReport, BatchProcessor, BatchProcessorConfig, BatchResult};
use crate::builders::Enqueuer;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
use crate::config::Config;
use crate::context::Context;
use crate::guard_stack::GuardStack;
use crate::ids::{IdGenerator, IdentifierService};
use crate::ingest_error::{IdentifierError, IngestError, TransportError};
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::model::{IngestionEvent, IngestionEventBody};
use crate::queue::{DirectSender, EventQueue, EventQueueConfig};
use crate::queue_monitor::{BackpressureHandler, OverflowPolicy, QueueLevel, QueueMonitor};
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;
use crate::transport::{HTTPTransport, Transport};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const ASYNC_ERROR_SINK_CAPACITY: usize = 100;
const IDLE_MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(30);
const BACKPRESSURE_BLOCK_DEADLINE: Duration = Duration::from_secs(5);

/// Snapshot of the circuit breaker guarding batch sends.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: usize,
    pub consecutive_successes: usize,
}

/// Snapshot of queue fill level and the backpressure policy's drop counter.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureStatus {
    pub level: QueueLevel,
    pub depth_estimate: usize,
    pub capacity: usize,
    pub dropped: u64,
}

/// Aggregated client counters, gathered from the components the facade owns.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub uptime: Duration,
    pub queue: BackpressureStatus,
    pub circuit_breaker: CircuitBreakerState,
    pub overflow_sync_sends: u64,
    pub id_fallback_count: u64,
    pub dropped_async_errors: u64,
}

/// Builds a fully wired [`Client`] from a [`Config`].
pub struct ClientBuilder {
    config: Config,
    overflow_policy: OverflowPolicy,
    id_failure_policy: crate::ids::FailurePolicy,
    transport_override: Option<Arc<dyn Transport>>,
    circuit_breaker_override: Option<CircuitBreakerConfig>,
    retry_override: Option<RetryPolicy<TransportError>>,
}

impl ClientBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            overflow_policy: OverflowPolicy::default(),
            id_failure_policy: crate::ids::FailurePolicy::default(),
            transport_override: None,
            circuit_breaker_override: None,
            retry_override: None,
        }
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn id_failure_policy(mut self, policy: crate::ids::FailurePolicy) -> Self {
        self.id_failure_policy = policy;
        self
    }

    /// Substitute the transport the client sends batches through, bypassing the built-in
    /// `HTTPTransport`. Meant for tests driving the client against a stub.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport_override = Some(transport);
        self
    }

    /// Substitute the circuit breaker configuration guarding batch sends, bypassing the
    /// built-in default (`failure_threshold: 5, recovery_timeout: 30s`). Meant for tests that
    /// need to drive the breaker through its full state cycle on a useful timescale.
    pub fn circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_override = Some(config);
        self
    }

    /// Substitute the retry policy wrapping the transport, bypassing the built-in default
    /// (`max_attempts: 3`). Meant for tests where each retry attempt must map 1:1 onto a circuit
    /// breaker failure count instead of being retried internally.
    pub fn retry_policy(mut self, policy: RetryPolicy<TransportError>) -> Self {
        self.retry_override = Some(policy);
        self
    }

    pub fn build(self) -> Result<Client, TransportError> {
        Client::from_builder(self)
    }
}

/// The object application code holds: `enqueue` traces/observations/scores through it, `flush`
/// the pending slice synchronously, and `shutdown` it once before dropping.
pub struct Client {
    config: Config,
    ids: Arc<IdentifierService>,
    queue: Arc<EventQueue>,
    backpressure: Arc<BackpressureHandler>,
    lifecycle: Arc<LifecycleManager>,
    processor: Arc<BatchProcessor>,
    drain_tx: watch::Sender<bool>,
    processor_handle: Mutex<Option<JoinHandle<()>>>,
    ticker_handle: Mutex<Option<JoinHandle<()>>>,
    async_errors: Arc<Mutex<VecDeque<AsyncErrorReport>>>,
    dropped_async_errors: Arc<AtomicU64>,
}

impl Client {
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn new(config: Config) -> Result<Self, TransportError> {
        ClientBuilder::new(config).build()
    }

    fn from_builder(builder: ClientBuilder) -> Result<Self, TransportError> {
        let ClientBuilder {
            config,
            overflow_policy,
            id_failure_policy,
            transport_override,
            circuit_breaker_override,
            retry_override,
        } = builder;

        let transport: Arc<dyn Transport> = match transport_override {
            Some(transport) => transport,
            None => Arc::new(
                HTTPTransport::builder(config.base_url.clone(), config.public_key.clone(), config.secret_key.clone())
                    .timeout(config.request_timeout)
                    .max_idle_conns(config.max_idle_conns)
                    .max_idle_conns_per_host(config.max_idle_conns_per_host)
                    .build()?,
            ),
        };

        let retry = retry_override.unwrap_or_else(|| {
            RetryPolicy::builder()
                .max_attempts(3)
                .expect("3 is a valid max_attempts")
                .should_retry(TransportError::is_retryable)
                .retry_after(TransportError::retry_after)
                .build()
        });
        let circuit_breaker = match circuit_breaker_override {
            Some(cfg) => CircuitBreakerPolicy::with_config(cfg),
            None => CircuitBreakerPolicy::new(5, Duration::from_secs(30)),
        };
        let guard = GuardStack::new(
            retry,
            circuit_breaker,
            TimeoutPolicy::new(config.request_timeout).map_err(|_| {
                TransportError::Decode("request_timeout could not be applied to the guard stack".into())
            })?,
        );

        let async_errors: Arc<Mutex<VecDeque<AsyncErrorReport>>> = Arc::new(Mutex::new(VecDeque::new()));
        let dropped_async_errors = Arc::new(AtomicU64::new(0));
        let sink = async_errors.clone();
        let dropped = dropped_async_errors.clone();

        let processor = Arc::new(
            BatchProcessor::new(transport, guard, BatchProcessorConfig { shutdown_timeout: config.shutdown_timeout })
                .on_async_error(move |report| {
                    let mut sink = sink.lock().expect("async error sink mutex poisoned");
                    if sink.len() >= ASYNC_ERROR_SINK_CAPACITY {
                        sink.pop_front();
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    sink.push_back(report.clone());
                }),
        );

        let processor_for_sender = processor.clone();
        let direct_sender: DirectSender = Arc::new(move |events| {
            let processor = processor_for_sender.clone();
            Box::pin(async move {
                processor.send_batch(events).await;
            })
        });

        let queue_config = EventQueueConfig {
            batch_size: config.batch_size,
            batch_queue_size: config.batch_queue_size,
            max_background_senders: config.max_background_senders,
        };
        let (queue, batch_rx) = EventQueue::new(queue_config, direct_sender);
        let queue = Arc::new(queue);

        let backpressure = Arc::new(BackpressureHandler::new(QueueMonitor::new(queue.capacity()), overflow_policy));

        let mut lifecycle = LifecycleManager::new();
        if let Some(idle) = config.idle_warning_duration {
            lifecycle = lifecycle.with_idle_warning(idle);
        }
        let lifecycle = Arc::new(lifecycle);

        let (drain_tx, drain_rx) = watch::channel(false);
        let processor_handle = tokio::spawn(processor.clone().run(batch_rx, drain_rx));

        if config.idle_warning_duration.is_some() {
            // Self-cancels once the lifecycle leaves `Active`; nothing to store or abort.
            lifecycle.spawn_idle_monitor(IDLE_MONITOR_POLL_INTERVAL, || {
                tracing::warn!("client has been idle past the configured warning threshold");
            });
        }

        let flush_ticker = Self::spawn_flush_ticker(queue.clone(), config.flush_interval);

        Ok(Self {
            config,
            ids: Arc::new(IdentifierService::new(id_failure_policy)),
            queue,
            backpressure,
            lifecycle,
            processor,
            drain_tx,
            processor_handle: Mutex::new(Some(processor_handle)),
            ticker_handle: Mutex::new(Some(flush_ticker)),
            async_errors,
            dropped_async_errors,
        })
    }

    fn spawn_flush_ticker(queue: Arc<EventQueue>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; nothing to flush yet.
            loop {
                ticker.tick().await;
                if queue.is_closed() {
                    return;
                }
                queue.flush_pending_into_queue().await;
            }
        })
    }

    /// Enqueue a pre-built event, honoring backpressure and recording activity for the idle
    /// monitor. Builders call this through [`Enqueuer`]; it is also available directly.
    pub async fn enqueue(&self, event: IngestionEvent, ctx: &Context) -> Result<(), IngestError> {
        if ctx.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        if self.lifecycle.state() != LifecycleState::Active {
            return Err(IngestError::ClientClosed);
        }
        let queue = self.queue.clone();
        let deadline = ctx.remaining_or(BACKPRESSURE_BLOCK_DEADLINE);
        self.backpressure.admit(|| queue.depth_estimate(), deadline).await?;
        self.queue.enqueue(event).await?;
        self.lifecycle.record_activity();
        Ok(())
    }

    /// Send the currently pending slice synchronously, bypassing `batchQueue`. Does not drain
    /// batches already detached and queued for the background processor. Unlike the background
    /// consumer, a `Flush` caller is waiting right here for the round trip, so partial or total
    /// failures surface as a typed [`IngestError`] instead of being folded into a string and
    /// routed only to the async error sink.
    pub async fn flush(&self, ctx: &Context) -> Result<BatchResult, IngestError> {
        if ctx.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let pending = self.queue.take_pending_snapshot();
        let send = self.processor.send_batch_checked(pending);
        match ctx.deadline_remaining() {
            Some(remaining) => match tokio::time::timeout(remaining, send).await {
                Ok(result) => result.map_err(|(_, err)| err),
                Err(_) => Err(IngestError::DeadlineExceeded),
            },
            None => send.await.map_err(|(_, err)| err),
        }
    }

    /// Idempotent: `Active -> ShuttingDown -> Closed`. A second caller observes
    /// [`IngestError::ClientClosed`] rather than re-running the sequence.
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), IngestError> {
        if !self.lifecycle.try_begin_shutdown() {
            return Err(IngestError::ClientClosed);
        }

        if let Some(handle) = self.ticker_handle.lock().expect("ticker handle mutex poisoned").take() {
            handle.abort();
        }

        self.queue.flush_pending_into_queue().await;
        self.queue.close();
        let _ = self.drain_tx.send(true);

        let deadline = ctx.remaining_or(self.config.shutdown_timeout);
        let handle = self.processor_handle.lock().expect("processor handle mutex poisoned").take();
        if let Some(handle) = handle {
            match tokio::time::timeout(deadline, handle).await {
                Ok(_) => {}
                Err(_) => {
                    let lost = self.queue.depth_estimate();
                    self.lifecycle.mark_closed();
                    return Err(IngestError::Shutdown { lost_events: lost });
                }
            }
        }

        self.lifecycle.mark_closed();
        Ok(())
    }

    /// Alias for [`Self::shutdown`], matching the spec's `Close` naming.
    pub async fn close(&self, ctx: &Context) -> Result<(), IngestError> {
        self.shutdown(ctx).await
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn uptime(&self) -> Duration {
        self.lifecycle.uptime()
    }

    pub fn backpressure_status(&self) -> BackpressureStatus {
        BackpressureStatus {
            level: self.backpressure.monitor().level(),
            depth_estimate: self.queue.depth_estimate(),
            capacity: self.queue.capacity(),
            dropped: self.backpressure.dropped_count(),
        }
    }

    pub fn circuit_breaker_state(&self) -> CircuitBreakerState {
        let breaker = self.processor.circuit_breaker();
        CircuitBreakerState {
            state: breaker.state(),
            failure_count: breaker.failure_count(),
            consecutive_successes: breaker.consecutive_successes(),
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            uptime: self.uptime(),
            queue: self.backpressure_status(),
            circuit_breaker: self.circuit_breaker_state(),
            overflow_sync_sends: self.queue.overflow_sync_send_count(),
            id_fallback_count: self.ids.fallback_count(),
            dropped_async_errors: self.dropped_async_errors.load(Ordering::Relaxed),
        }
    }

    /// Async errors recorded since construction, oldest first, capped at the sink capacity.
    pub fn recent_async_errors(&self) -> Vec<AsyncErrorReport> {
        self.async_errors.lock().expect("async error sink mutex poisoned").iter().cloned().collect()
    }

    /// Ship a debug-level entry through the same ingestion pipeline as user data.
    pub async fn log_debug(&self, message: impl Into<String>, ctx: &Context) -> Result<(), IngestError> {
        self.log("debug", message.into(), ctx).await
    }

    /// Ship a warn-level entry through the same ingestion pipeline as user data.
    pub async fn log_warn(&self, message: impl Into<String>, ctx: &Context) -> Result<(), IngestError> {
        self.log("warn", message.into(), ctx).await
    }

    async fn log(&self, level: &'static str, message: String, ctx: &Context) -> Result<(), IngestError> {
        let event = IngestionEvent {
            id: self.ids.new_id().unwrap_or_default(),
            timestamp: Utc::now(),
            body: IngestionEventBody::SdkLog(serde_json::json!({ "level": level, "message": message })),
        };
        self.enqueue(event, ctx).await
    }

    /// Probe `/health` on the ingestion endpoint using the same authenticated transport.
    pub async fn health(&self) -> Result<crate::transport::HealthStatus, TransportError> {
        self.processor.transport().health().await
    }
}

#[async_trait]
impl Enqueuer for Client {
    async fn enqueue(&self, event: IngestionEvent, ctx: &Context) -> Result<(), IngestError> {
        Client::enqueue(self, event, ctx).await
    }

    fn new_id(&self) -> Result<String, IdentifierError> {
        self.ids.new_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Batch;

    struct RejectingTransport;

    #[async_trait]
    impl Transport for RejectingTransport {
        async fn send_batch(&self, _batch: &Batch) -> Result<crate::model::IngestionResponse, TransportError> {
            Err(TransportError::Rejected { status: 400, body: "bad batch".into() })
        }
    }

    fn test_config() -> Config {
        Config::builder()
            .public_key("pk-1234567")
            .secret_key("sk-1234567")
            .base_url("https://example.test/api/public")
            .batch_size(2)
            .batch_queue_size(4)
            .flush_interval(Duration::from_secs(3600))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_reports_client_closed() {
        let client = Client::new(test_config()).unwrap();
        let ctx = Context::none();
        client.shutdown(&ctx).await.unwrap();

        let event = IngestionEvent {
            id: "evt-1".into(),
            timestamp: Utc::now(),
            body: IngestionEventBody::SdkLog(serde_json::json!({})),
        };
        let result = client.enqueue(event, &ctx).await;
        assert!(matches!(result, Err(IngestError::ClientClosed)));
    }

    #[tokio::test]
    async fn second_shutdown_call_is_rejected() {
        let client = Client::new(test_config()).unwrap();
        let ctx = Context::none();
        client.shutdown(&ctx).await.unwrap();
        let result = client.shutdown(&ctx).await;
        assert!(matches!(result, Err(IngestError::ClientClosed)));
    }

    #[tokio::test]
    async fn flush_surfaces_a_typed_error_instead_of_swallowing_it() {
        let client = Client::builder(test_config()).transport(Arc::new(RejectingTransport)).build().unwrap();
        let ctx = Context::none();
        client.log_debug("will be rejected", &ctx).await.unwrap();
        let err = client.flush(&ctx).await.unwrap_err();
        assert!(matches!(err, IngestError::PermanentApi(_)));
        client.shutdown(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn fresh_client_starts_active_with_empty_stats() {
        let client = Client::new(test_config()).unwrap();
        assert_eq!(client.state(), LifecycleState::Active);
        let stats = client.stats();
        assert_eq!(stats.queue.depth_estimate, 0);
        assert_eq!(stats.circuit_breaker.state, CircuitState::Closed);
        client.shutdown(&Context::none()).await.unwrap();
    }

    #[tokio::test]
    async fn log_debug_enqueues_sdk_log_event() {
        let client = Client::new(test_config()).unwrap();
        let ctx = Context::none();
        client.log_debug("hello", &ctx).await.unwrap();
        assert_eq!(client.backpressure_status().depth_estimate, 1);
        client.shutdown(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits_enqueue() {
        let client = Client::new(test_config()).unwrap();
        let token = crate::context::CancellationToken::new();
        token.cancel();
        let ctx = Context::with_cancellation(token);
        let event = IngestionEvent {
            id: "evt-1".into(),
            timestamp: Utc::now(),
            body: IngestionEventBody::SdkLog(serde_json::json!({})),
        };
        let result = client.enqueue(event, &ctx).await;
        assert!(matches!(result, Err(IngestError::Cancelled)));
        client.shutdown(&Context::none()).await.unwrap();
    }
}
