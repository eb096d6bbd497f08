//! Convenient re-exports for common langfuse-core types.
pub use crate::{
    batch_traces, batch_spans,
    Backoff, Jitter,
    BuilderBatchResult, BuilderError, Enqueuer,
    CircuitBreakerConfig, CircuitState,
    Client, ClientBuilder,
    Config, ConfigBuilder, Region,
    CancellationToken, Context,
    EventBuilder, GenerationBuilder, ScoreBuilder, SpanBuilder, TraceBuilder,
    GuardError, GuardStack,
    IdGenerator, IdentifierService,
    IngestError, TransportError, ValidationError,
    ObservationContext, TraceContext,
    RetryPolicy, RetryPolicyBuilder,
    TimeoutError, TimeoutPolicy, MAX_TIMEOUT,
    Transport, HTTPTransport, HTTPTransportBuilder,
};
