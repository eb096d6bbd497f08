#![forbid(unsafe_code)]

//! # langfuse-core
//!
//! Async client SDK for shipping traces, observations, and scores to a Langfuse-compatible
//! ingestion endpoint: a resilient batching pipeline (retry, circuit breaker, timeout), fluent
//! builders for traces/spans/generations/events/scores, and the client facade that ties them
//! together.
//!
//! ## Quick start
//!
//! ```no_run
//! use langfuse_core::{Client, Config, TraceBuilder};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::builder()
//!     .public_key("pk-...")
//!     .secret_key("sk-...")
//!     .build()?;
//! let client = Client::new(config)?;
//!
//! use langfuse_core::Context;
//!
//! let ctx = Context::none();
//! let trace = TraceBuilder::new().name("checkout").create(&client, &ctx).await?;
//! trace.span().name("validate-cart").create(&client, &ctx).await?;
//!
//! client.shutdown(&ctx).await?;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod batch_processor;
mod builders;
mod circuit_breaker;
mod client;
mod clock;
mod config;
mod context;
mod error;
mod guard_stack;
mod ids;
mod ingest_error;
mod jitter;
mod lifecycle;
mod model;
mod queue;
mod queue_monitor;
mod retry;
mod sleeper;
mod timeout;
mod transport;

// Re-exports
pub use backoff::{
    Backoff, BackoffError, BackoffStrategy, ConstantBackoff, ExponentialBackoff, LinearBackoff,
    MAX_BACKOFF,
};
pub use batch_processor::{AsyncErrorReport, BatchProcessorConfig, BatchResult, DrainOutcome};
pub use builders::{
    batch_spans, batch_traces, BuildResult, BuilderBatchResult, BuilderError, Enqueuer,
    EventBuilder, GenerationBuilder, ObservationContext, ScoreBuilder, SpanBuilder, TraceBuilder,
    TraceContext, ValidationMode,
};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use client::{BackpressureStatus, CircuitBreakerState, Client, ClientBuilder, Stats};
pub use clock::{Clock, MonotonicClock};
pub use config::{Config, ConfigBuilder, Region};
pub use context::{CancellationToken, Context};
pub use error::GuardError;
pub use guard_stack::GuardStack;
pub use ids::{AlwaysFallbackGenerator, FailurePolicy, IdGenerator, IdentifierService};
pub use ingest_error::{ConfigError, IdentifierError, IngestError, TransportError, ValidationError};
pub use jitter::Jitter;
pub use lifecycle::{LifecycleManager, LifecycleState};
pub use model::{
    Batch, BatchMetadata, Event, Generation, IngestionEvent, IngestionEventBody,
    IngestionResponse, ObservationCommon, ObservationLevel, Score, ScoreDataType, ScoreSource,
    Span, Trace, Usage,
};
pub use queue::{EventQueueConfig};
pub use queue_monitor::{BackpressureHandler, OverflowPolicy, PollInterval, QueueLevel, QueueMonitor, QueueMonitorConfig};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
pub use transport::{HTTPTransport, HTTPTransportBuilder, HealthStatus, Transport};

pub mod prelude;
