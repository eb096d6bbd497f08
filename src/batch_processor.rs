//! Single consumer that drains `batchQueue`, sends each batch through the resilience guard
//! stack, and reports outcomes via a synchronous callback plus the async error sink.
//!
//! Composition mirrors the teacher's resilience stack's "policies wrap an operation" style: the
//! guard stack (retry → circuit breaker → timeout) wraps a single `Transport::send_batch` call
//! per attempt.

use crate::error::GuardError;
use crate::guard_stack::GuardStack;
use crate::ingest_error::{IngestError, IngestionEventError, TransportError};
use crate::model::{Batch, BatchMetadata, IngestionEvent};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Outcome of one batch send, reported synchronously after every attempt.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub event_count: usize,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub successes: usize,
    pub errors: usize,
}

/// `{operation, timestamp, err, retryable}` reported through the async error sink.
#[derive(Debug, Clone)]
pub struct AsyncErrorReport {
    pub operation: &'static str,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchProcessorConfig {
    pub shutdown_timeout: Duration,
}

impl Default for BatchProcessorConfig {
    fn default() -> Self {
        Self { shutdown_timeout: Duration::from_secs(10) }
    }
}

/// Stats from one drain pass, used by the lifecycle manager's shutdown report.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainOutcome {
    pub batches_sent: usize,
    pub timed_out: bool,
}

pub struct BatchProcessor {
    transport: Arc<dyn Transport>,
    guard: GuardStack<TransportError>,
    on_batch_flushed: Arc<dyn Fn(&BatchResult) + Send + Sync>,
    on_async_error: Arc<dyn Fn(&AsyncErrorReport) + Send + Sync>,
    config: BatchProcessorConfig,
}

impl BatchProcessor {
    pub fn new(transport: Arc<dyn Transport>, guard: GuardStack<TransportError>, config: BatchProcessorConfig) -> Self {
        Self { transport, guard, on_batch_flushed: Arc::new(|_| {}), on_async_error: Arc::new(|_| {}), config }
    }

    pub fn on_batch_flushed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BatchResult) + Send + Sync + 'static,
    {
        self.on_batch_flushed = Arc::new(callback);
        self
    }

    pub fn on_async_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AsyncErrorReport) + Send + Sync + 'static,
    {
        self.on_async_error = Arc::new(callback);
        self
    }

    /// The guard stack's circuit breaker, for status reporting.
    pub fn circuit_breaker(&self) -> &crate::circuit_breaker::CircuitBreakerPolicy {
        self.guard.circuit_breaker()
    }

    /// The transport this processor sends through, for out-of-band calls like a health probe.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Consumer loop: drains new batches until told to drain, then switches into
    /// [`Self::drain`] and returns.
    pub async fn run(self: Arc<Self>, mut batch_rx: mpsc::Receiver<Vec<IngestionEvent>>, mut drain_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                changed = drain_rx.changed() => {
                    if changed.is_err() || *drain_rx.borrow() {
                        self.drain(&mut batch_rx).await;
                        return;
                    }
                }
                batch = batch_rx.recv() => {
                    match batch {
                        Some(batch) => { self.send_batch(batch).await; }
                        None => return,
                    }
                }
            }
        }
    }

    /// Stop accepting new batches and ship whatever is already queued, bounded by
    /// `shutdown_timeout`. The caller (`EventQueue`) is responsible for flushing any leftover
    /// pending slice into `batchQueue` before this is invoked.
    pub async fn drain(&self, batch_rx: &mut mpsc::Receiver<Vec<IngestionEvent>>) -> DrainOutcome {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut outcome = DrainOutcome::default();

        loop {
            if Instant::now() >= deadline {
                outcome.timed_out = true;
                break;
            }
            match batch_rx.try_recv() {
                Ok(batch) => {
                    self.send_batch(batch).await;
                    outcome.batches_sent += 1;
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        outcome
    }

    /// Send one batch through the guard stack and report the outcome. Used by the main loop/drain
    /// path and `EventQueue`'s overflow senders, neither of which has anyone waiting synchronously
    /// on the typed error — failures are folded into `BatchResult.error` and routed to the async
    /// error sink instead of propagated.
    pub async fn send_batch(&self, events: Vec<IngestionEvent>) -> BatchResult {
        match self.send_batch_checked(events).await {
            Ok(result) => result,
            Err((result, _ingest_err)) => result,
        }
    }

    /// Same send, but preserves the classified [`IngestError`] instead of folding it into
    /// `BatchResult.error`'s string. Used by `Client::flush`, whose caller is waiting
    /// synchronously and can act on the typed variant (e.g. retry on `TransientApi`).
    pub async fn send_batch_checked(&self, events: Vec<IngestionEvent>) -> Result<BatchResult, (BatchResult, IngestError)> {
        let event_count = events.len();
        let batch = Batch { batch: events, metadata: Some(BatchMetadata::default()) };
        let start = Instant::now();

        let transport = self.transport.clone();
        let result = self
            .guard
            .execute(move || {
                let transport = transport.clone();
                let batch = batch.clone();
                async move { transport.send_batch(&batch).await.map_err(GuardError::Inner) }
            })
            .await;

        let duration = start.elapsed();

        match result {
            Ok(response) => {
                let errors = response.errors.len();
                let successes = event_count.saturating_sub(errors);
                let batch_result =
                    BatchResult { event_count, success: errors == 0, error: None, duration, successes, errors };

                if errors > 0 {
                    self.report_async_error(
                        "batch_send",
                        format!("{errors} of {event_count} events rejected by server"),
                        false,
                    );
                }
                (self.on_batch_flushed)(&batch_result);

                if errors > 0 {
                    let rejected = response
                        .errors
                        .into_iter()
                        .map(|e| IngestionEventError {
                            id: e.id,
                            status: e.status,
                            message: e.message.unwrap_or_default(),
                        })
                        .collect();
                    let ingest_err = IngestError::PartialFailure(TransportError::PartialFailure {
                        total: event_count,
                        failure_count: errors,
                        errors: rejected,
                    });
                    Err((batch_result, ingest_err))
                } else {
                    Ok(batch_result)
                }
            }
            Err(guard_err) => {
                let ingest_err = IngestError::from_guard(guard_err);
                let retryable = matches!(
                    ingest_err,
                    IngestError::TransientApi { .. } | IngestError::RateLimited { .. } | IngestError::CircuitOpen { .. }
                );
                self.report_async_error("batch_send", ingest_err.to_string(), retryable);

                let batch_result = BatchResult {
                    event_count,
                    success: false,
                    error: Some(ingest_err.to_string()),
                    duration,
                    successes: 0,
                    errors: event_count,
                };
                (self.on_batch_flushed)(&batch_result);
                Err((batch_result, ingest_err))
            }
        }
    }

    fn report_async_error(&self, operation: &'static str, message: String, retryable: bool) {
        let report = AsyncErrorReport { operation, timestamp: Utc::now(), message, retryable };
        tracing::warn!(operation, retryable, message = %report.message, "async batch error");
        (self.on_async_error)(&report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerPolicy;
    use crate::model::{IngestionEventBody, IngestionResponse, Trace};
    use crate::retry::RetryPolicy;
    use crate::sleeper::InstantSleeper;
    use crate::timeout::TimeoutPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn sample_event(id: &str) -> IngestionEvent {
        IngestionEvent {
            id: id.to_string(),
            timestamp: Utc::now(),
            body: IngestionEventBody::TraceCreate(Trace {
                id: id.to_string(),
                timestamp: Utc::now(),
                name: None,
                user_id: None,
                session_id: None,
                input: None,
                output: None,
                metadata: None,
                tags: None,
                release: None,
                version: None,
                public: None,
                environment: None,
            }),
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl Transport for AlwaysOk {
        async fn send_batch(&self, _batch: &Batch) -> Result<IngestionResponse, TransportError> {
            Ok(IngestionResponse::default())
        }
    }

    struct AlwaysRejected;

    #[async_trait]
    impl Transport for AlwaysRejected {
        async fn send_batch(&self, _batch: &Batch) -> Result<IngestionResponse, TransportError> {
            Err(TransportError::Rejected { status: 400, body: "bad batch".into() })
        }
    }

    fn test_guard() -> GuardStack<TransportError> {
        GuardStack::new(
            RetryPolicy::builder().max_attempts(2).unwrap().with_sleeper(InstantSleeper).build(),
            CircuitBreakerPolicy::new(5, Duration::from_secs(30)),
            TimeoutPolicy::new(Duration::from_secs(1)).unwrap(),
        )
    }

    #[tokio::test]
    async fn successful_send_reports_batch_result_with_no_error() {
        let processor = BatchProcessor::new(Arc::new(AlwaysOk), test_guard(), BatchProcessorConfig::default());
        let result = processor.send_batch(vec![sample_event("1"), sample_event("2")]).await;
        assert!(result.success);
        assert_eq!(result.successes, 2);
        assert_eq!(result.errors, 0);
    }

    #[tokio::test]
    async fn permanent_rejection_routes_to_async_error_sink() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();
        let processor = BatchProcessor::new(Arc::new(AlwaysRejected), test_guard(), BatchProcessorConfig::default())
            .on_async_error(move |report| reports_clone.lock().unwrap().push(report.clone()));

        let result = processor.send_batch(vec![sample_event("1")]).await;
        assert!(!result.success);
        assert_eq!(reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drain_sends_all_queued_batches_before_deadline() {
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.try_send(vec![sample_event(&i.to_string())]).unwrap();
        }
        drop(tx);

        let sent = Arc::new(AtomicUsize::new(0));
        let sent_clone = sent.clone();
        let processor = BatchProcessor::new(Arc::new(AlwaysOk), test_guard(), BatchProcessorConfig::default())
            .on_batch_flushed(move |_| {
                sent_clone.fetch_add(1, Ordering::SeqCst);
            });

        let outcome = processor.drain(&mut rx).await;
        assert_eq!(outcome.batches_sent, 3);
        assert!(!outcome.timed_out);
        assert_eq!(sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_loop_switches_to_drain_on_signal() {
        let (batch_tx, batch_rx) = mpsc::channel(8);
        let (drain_tx, drain_rx) = watch::channel(false);
        batch_tx.try_send(vec![sample_event("1")]).unwrap();

        let sent = Arc::new(AtomicUsize::new(0));
        let sent_clone = sent.clone();
        let processor = Arc::new(
            BatchProcessor::new(Arc::new(AlwaysOk), test_guard(), BatchProcessorConfig::default()).on_batch_flushed(
                move |_| {
                    sent_clone.fetch_add(1, Ordering::SeqCst);
                },
            ),
        );

        let handle = tokio::spawn(processor.run(batch_rx, drain_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        drain_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }
}
