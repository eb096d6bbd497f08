//! Two-stage event buffer: a mutex-protected pending slice being assembled, and a bounded
//! channel of ready batches drained by the batch processor.
//!
//! The overflow path (channel full) mirrors the teacher's bulkhead pattern's `Semaphore::try_acquire`
//! admission pattern: a bounded pool of background senders ships the detached batch directly,
//! and when that pool is saturated too the batch is sent synchronously on the caller's own task
//! rather than spawning past the configured concurrency ceiling.

use crate::ingest_error::IngestError;
use crate::model::IngestionEvent;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// Delivers a detached batch outside the normal `batchQueue` path (overflow sends, `Flush`).
pub type DirectSender = Arc<dyn Fn(Vec<IngestionEvent>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct EventQueueConfig {
    pub batch_size: usize,
    pub batch_queue_size: usize,
    pub max_background_senders: usize,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self { batch_size: 50, batch_queue_size: 50, max_background_senders: 10 }
    }
}

struct PendingState {
    pending: Vec<IngestionEvent>,
    closed: bool,
}

/// The producer-facing half of the ingestion pipeline. Cheap to share: wrap in `Arc`.
pub struct EventQueue {
    state: Mutex<PendingState>,
    batch_tx: mpsc::Sender<Vec<IngestionEvent>>,
    overflow_semaphore: Arc<Semaphore>,
    direct_sender: DirectSender,
    overflow_sync_sends: AtomicU64,
    config: EventQueueConfig,
}

impl EventQueue {
    /// `direct_sender` is how an overflowing batch gets delivered outside `batchQueue` — in
    /// practice a closure that runs the batch through the same guard stack used by the batch
    /// processor. Returns the queue plus the receiving end of `batchQueue` for the batch
    /// processor to drain.
    pub fn new(config: EventQueueConfig, direct_sender: DirectSender) -> (Self, mpsc::Receiver<Vec<IngestionEvent>>) {
        let (batch_tx, batch_rx) = mpsc::channel(config.batch_queue_size);
        let queue = Self {
            state: Mutex::new(PendingState { pending: Vec::with_capacity(config.batch_size), closed: false }),
            batch_tx,
            overflow_semaphore: Arc::new(Semaphore::new(config.max_background_senders)),
            direct_sender,
            overflow_sync_sends: AtomicU64::new(0),
            config,
        };
        (queue, batch_rx)
    }

    /// Append `event` to the pending slice; detach and dispatch it once `batch_size` is reached.
    pub async fn enqueue(&self, event: IngestionEvent) -> Result<(), IngestError> {
        let detached = {
            let mut state = self.state.lock().expect("event queue mutex poisoned");
            if state.closed {
                return Err(IngestError::ClientClosed);
            }
            state.pending.push(event);
            if state.pending.len() >= self.config.batch_size {
                Some(std::mem::replace(&mut state.pending, Vec::with_capacity(self.config.batch_size)))
            } else {
                None
            }
        };

        if let Some(batch) = detached {
            self.dispatch(batch).await;
        }
        Ok(())
    }

    /// Detach whatever is currently pending (regardless of size) and dispatch it. Called by the
    /// flush-interval ticker and, one final time, by the lifecycle manager before drain.
    pub async fn flush_pending_into_queue(&self) {
        let detached = {
            let mut state = self.state.lock().expect("event queue mutex poisoned");
            if state.pending.is_empty() {
                return;
            }
            std::mem::replace(&mut state.pending, Vec::with_capacity(self.config.batch_size))
        };
        self.dispatch(detached).await;
    }

    /// Snapshot and clear the pending slice without touching `batchQueue` — used by `Flush`,
    /// which sends only the pending slice synchronously and does not drain already-queued
    /// batches.
    pub fn take_pending_snapshot(&self) -> Vec<IngestionEvent> {
        let mut state = self.state.lock().expect("event queue mutex poisoned");
        std::mem::replace(&mut state.pending, Vec::with_capacity(self.config.batch_size))
    }

    async fn dispatch(&self, batch: Vec<IngestionEvent>) {
        match self.batch_tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => self.send_overflow(batch).await,
            Err(mpsc::error::TrySendError::Closed(batch)) => self.send_overflow(batch).await,
        }
    }

    async fn send_overflow(&self, batch: Vec<IngestionEvent>) {
        match self.overflow_semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let sender = self.direct_sender.clone();
                tokio::spawn(async move {
                    sender(batch).await;
                    drop(permit);
                });
            }
            Err(_) => {
                self.overflow_sync_sends.fetch_add(1, Ordering::Relaxed);
                (self.direct_sender)(batch).await;
            }
        }
    }

    /// Number of overflow batches sent synchronously on the caller's task because the background
    /// sender pool was saturated. Exposed for tests and for `Stats()`.
    pub fn overflow_sync_send_count(&self) -> u64 {
        self.overflow_sync_sends.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.state.lock().expect("event queue mutex poisoned").closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("event queue mutex poisoned").closed
    }

    /// `len(pending) + len(batchQueue) * BatchSize`, the queue-depth estimate backpressure acts
    /// on.
    pub fn depth_estimate(&self) -> usize {
        let pending_len = self.state.lock().expect("event queue mutex poisoned").pending.len();
        let queued_batches = self.batch_tx.max_capacity() - self.batch_tx.capacity();
        pending_len + queued_batches * self.config.batch_size
    }

    pub fn capacity(&self) -> usize {
        self.config.batch_size * self.config.batch_queue_size + self.config.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IngestionEventBody, Trace};
    use chrono::Utc;

    fn test_event(id: &str) -> IngestionEvent {
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

    fn noop_sender() -> DirectSender {
        Arc::new(|_batch| Box::pin(async {}))
    }

    #[tokio::test]
    async fn enqueue_detaches_batch_once_size_reached() {
        let config = EventQueueConfig { batch_size: 2, batch_queue_size: 4, max_background_senders: 2 };
        let (queue, mut rx) = EventQueue::new(config, noop_sender());

        queue.enqueue(test_event("1")).await.unwrap();
        assert!(rx.try_recv().is_err(), "should not flush before batch_size is reached");

        queue.enqueue(test_event("2")).await.unwrap();
        let batch = rx.try_recv().expect("batch should be ready after 2nd event");
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn enqueue_after_close_fails_with_client_closed() {
        let config = EventQueueConfig::default();
        let (queue, _rx) = EventQueue::new(config, noop_sender());
        queue.close();

        let result = queue.enqueue(test_event("1")).await;
        assert!(matches!(result, Err(IngestError::ClientClosed)));
    }

    #[tokio::test]
    async fn flush_pending_dispatches_partial_batch() {
        let config = EventQueueConfig { batch_size: 10, batch_queue_size: 4, max_background_senders: 2 };
        let (queue, mut rx) = EventQueue::new(config, noop_sender());

        queue.enqueue(test_event("1")).await.unwrap();
        queue.flush_pending_into_queue().await;

        let batch = rx.try_recv().expect("partial batch should flush");
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn overflow_sends_directly_when_channel_full() {
        let config = EventQueueConfig { batch_size: 1, batch_queue_size: 1, max_background_senders: 1 };
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let sender: DirectSender = Arc::new(move |batch| {
            let received = received_clone.clone();
            Box::pin(async move {
                received.lock().unwrap().extend(batch);
            })
        });
        let (queue, mut rx) = EventQueue::new(config, sender);

        // Fill the one-slot channel.
        queue.enqueue(test_event("1")).await.unwrap();
        // This one can't fit in batchQueue (capacity 1, already full), so it overflows.
        queue.enqueue(test_event("2")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn depth_estimate_accounts_for_pending_and_queued_batches() {
        let config = EventQueueConfig { batch_size: 2, batch_queue_size: 4, max_background_senders: 2 };
        let (queue, _rx) = EventQueue::new(config, noop_sender());

        queue.enqueue(test_event("1")).await.unwrap();
        queue.enqueue(test_event("2")).await.unwrap();
        queue.enqueue(test_event("3")).await.unwrap();

        assert_eq!(queue.depth_estimate(), 1 + 1 * 2);
    }
}
