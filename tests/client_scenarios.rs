//! End-to-end scenarios against a stub `Transport`, matching the concrete S1-S6 walkthroughs.

use async_trait::async_trait;
use langfuse_core::{
    Batch, CircuitBreakerConfig, CircuitState, Client, Config, Context, IngestionResponse,
    OverflowPolicy, PollInterval, RetryPolicy, Transport, TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every batch it receives and can be told to fail the first `fail_for` calls, or to
/// sleep `delay` before responding on every call.
struct StubTransport {
    batches: Mutex<Vec<Batch>>,
    calls: AtomicUsize,
    fail_for: usize,
    delay: Duration,
}

impl StubTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self { batches: Mutex::new(Vec::new()), calls: AtomicUsize::new(0), fail_for: 0, delay: Duration::ZERO })
    }

    fn failing(fail_for: usize) -> Arc<Self> {
        Arc::new(Self { batches: Mutex::new(Vec::new()), calls: AtomicUsize::new(0), fail_for, delay: Duration::ZERO })
    }

    fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self { batches: Mutex::new(Vec::new()), calls: AtomicUsize::new(0), fail_for: 0, delay })
    }

    fn received_event_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.batch.len()).sum()
    }

    fn post_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send_batch(&self, batch: &Batch) -> Result<IngestionResponse, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.fail_for {
            return Err(TransportError::Transient { status: 500, body: "boom".into(), retry_after: None });
        }
        self.batches.lock().unwrap().push(batch.clone());
        Ok(IngestionResponse::default())
    }
}

fn test_config(batch_size: usize, batch_queue_size: usize, flush_interval: Duration) -> Config {
    Config::builder()
        .public_key("pk-1234567")
        .secret_key("sk-1234567")
        .base_url("https://example.test/api/public")
        .batch_size(batch_size)
        .batch_queue_size(batch_queue_size)
        .flush_interval(flush_interval)
        .shutdown_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// S1 — happy path: 3 events under a batch size of 5, flushed explicitly.
#[tokio::test]
async fn s1_happy_path_flush_sends_exactly_the_pending_events() {
    let transport = StubTransport::new();
    let config = test_config(5, 10, Duration::from_secs(3600));
    let client = Client::builder(config).transport(transport.clone()).build().unwrap();
    let ctx = Context::none();

    client.log_debug("a", &ctx).await.unwrap();
    client.log_debug("b", &ctx).await.unwrap();
    client.log_debug("c", &ctx).await.unwrap();
    let result = client.flush(&ctx).await.unwrap();

    assert!(result.success);
    assert_eq!(result.event_count, 3);
    assert_eq!(transport.post_count(), 1);
    assert_eq!(transport.received_event_count(), 3);
    assert!(client.recent_async_errors().is_empty());

    client.shutdown(&ctx).await.unwrap();
}

/// S2 — size-triggered flush: 6 events at batch_size=5 with a long flush interval; the 5th event
/// should detach a full batch without waiting on the ticker.
#[tokio::test]
async fn s2_size_triggered_flush_delivers_once_batch_size_is_reached() {
    let transport = StubTransport::new();
    let config = test_config(5, 10, Duration::from_secs(3600));
    let client = Client::builder(config).transport(transport.clone()).build().unwrap();
    let ctx = Context::none();

    for i in 0..6 {
        client.log_debug(format!("event-{i}"), &ctx).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(transport.post_count() >= 1, "the 5-event batch should have been dispatched without a manual flush");

    let _ = client.flush(&ctx).await;
    client.shutdown(&ctx).await.unwrap();
    assert_eq!(transport.received_event_count(), 6);
}

/// S3 — shutdown drains whatever is left pending and queued, bounded by the shutdown timeout.
#[tokio::test]
async fn s3_shutdown_drains_all_outstanding_events() {
    let transport = StubTransport::new();
    let config = test_config(10, 10, Duration::from_secs(3600));
    let client = Client::builder(config).transport(transport.clone()).build().unwrap();
    let ctx = Context::none();

    for i in 0..50 {
        client.log_debug(format!("event-{i}"), &ctx).await.unwrap();
    }

    client.shutdown(&ctx).await.unwrap();
    assert_eq!(transport.received_event_count(), 50);
}

/// S4 — the literal circuit-breaker recovery cycle: `FailureThreshold=3`, `Timeout=10ms`,
/// `SuccessThreshold=2`. The server rejects the first 3 batches then accepts every subsequent one.
/// Retry is pinned to a single attempt so each flush maps onto exactly one breaker failure/success,
/// letting the test drive the full Closed -> Open -> HalfOpen -> Closed cycle.
#[tokio::test]
async fn s4_repeated_failures_open_then_recover_the_circuit_breaker() {
    let transport = StubTransport::failing(3);
    let config = test_config(1, 20, Duration::from_secs(3600));
    let client = Client::builder(config)
        .transport(transport.clone())
        .circuit_breaker_config(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(10),
            half_open_max_calls: 1,
            success_threshold: 2,
        })
        .retry_policy(
            RetryPolicy::builder()
                .max_attempts(1)
                .unwrap()
                .should_retry(TransportError::is_retryable)
                .retry_after(TransportError::retry_after)
                .build(),
        )
        .build()
        .unwrap();
    let ctx = Context::none();

    for i in 0..3 {
        client.log_debug(format!("event-{i}"), &ctx).await.unwrap();
        let err = client.flush(&ctx).await.unwrap_err();
        assert!(matches!(err, langfuse_core::IngestError::TransientApi { .. } | langfuse_core::IngestError::PermanentApi(_)));
    }
    assert_eq!(client.circuit_breaker_state().state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(15)).await;

    client.log_debug("event-3", &ctx).await.unwrap();
    client.flush(&ctx).await.unwrap();
    assert_eq!(client.circuit_breaker_state().state, CircuitState::HalfOpen);

    client.log_debug("event-4", &ctx).await.unwrap();
    client.flush(&ctx).await.unwrap();
    assert_eq!(client.circuit_breaker_state().state, CircuitState::Closed);

    client.shutdown(&ctx).await.unwrap();
}

/// S5 — the literal backpressure scenario: `BatchSize=1`, `BatchQueueSize=2`, blocking overflow
/// policy, a transport that sleeps 500ms per request. 100 events are each submitted with a 100ms
/// context deadline. Some calls must surface a backpressure error once the queue saturates; after
/// shutdown, received-by-the-server plus backpressure-errored must equal 100, with no duplicates.
#[tokio::test]
async fn s5_block_overflow_policy_rejects_once_the_queue_saturates() {
    let transport = StubTransport::delayed(Duration::from_millis(500));
    let config = test_config(1, 2, Duration::from_secs(3600));
    let client = Client::builder(config)
        .transport(transport.clone())
        .overflow_policy(OverflowPolicy::Block { poll_interval: PollInterval(Duration::from_millis(5)) })
        .build()
        .unwrap();

    let mut backpressure_errors = 0usize;
    for i in 0..100 {
        let ctx = Context::with_timeout(Duration::from_millis(100));
        match client.log_debug(format!("event-{i}"), &ctx).await {
            Ok(()) => {}
            Err(langfuse_core::IngestError::Backpressure) => backpressure_errors += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    client.shutdown(&Context::with_timeout(Duration::from_secs(30))).await.unwrap();

    let received = transport.received_event_count();
    assert_eq!(received + backpressure_errors, 100, "every submitted event must be either received or backpressure-errored");
    assert!(backpressure_errors > 0, "a 500ms-per-request transport behind a 2-slot queue must reject some calls");

    let mut seen_ids = std::collections::HashSet::new();
    for batch in transport.batches.lock().unwrap().iter() {
        for event in &batch.batch {
            assert!(seen_ids.insert(event.id.clone()), "event {} was received more than once", event.id);
        }
    }
}

/// S6 — a Trace with an empty tag fails validation and never reaches the transport.
#[tokio::test]
async fn s6_validation_rejection_never_enqueues() {
    let transport = StubTransport::new();
    let config = test_config(5, 10, Duration::from_secs(3600));
    let client = Client::builder(config).transport(transport.clone()).build().unwrap();
    let ctx = Context::none();

    let err = langfuse_core::TraceBuilder::new()
        .tags(vec!["ok".into(), String::new()])
        .create(&client, &ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, langfuse_core::BuilderError::Validation(_)));
    assert_eq!(client.backpressure_status().depth_estimate, 0);

    let _ = client.flush(&ctx).await;
    assert_eq!(transport.post_count(), 0);
    client.shutdown(&ctx).await.unwrap();
}

/// Invariant 2/3: a second shutdown is rejected, and submissions after shutdown never reach the
/// transport.
#[tokio::test]
async fn post_shutdown_submission_never_touches_the_network() {
    let transport = StubTransport::new();
    let config = test_config(5, 10, Duration::from_secs(3600));
    let client = Client::builder(config).transport(transport.clone()).build().unwrap();
    let ctx = Context::none();

    client.shutdown(&ctx).await.unwrap();
    let result = client.log_debug("too-late", &ctx).await;
    assert!(matches!(result, Err(langfuse_core::IngestError::ClientClosed)));
    assert_eq!(transport.post_count(), 0);

    let second = client.shutdown(&ctx).await;
    assert!(matches!(second, Err(langfuse_core::IngestError::ClientClosed)));
}

/// Invariant 5: no batch sent to the transport exceeds `batch_size`.
#[tokio::test]
async fn batch_size_bound_is_never_exceeded() {
    let transport = StubTransport::new();
    let config = test_config(4, 20, Duration::from_secs(3600));
    let client = Client::builder(config).transport(transport.clone()).build().unwrap();
    let ctx = Context::none();

    for i in 0..17 {
        client.log_debug(format!("event-{i}"), &ctx).await.unwrap();
    }
    client.shutdown(&ctx).await.unwrap();

    for batch in transport.batches.lock().unwrap().iter() {
        assert!(batch.batch.len() <= 4, "batch of {} exceeds configured batch_size", batch.batch.len());
    }
    assert_eq!(transport.received_event_count(), 17);
}
