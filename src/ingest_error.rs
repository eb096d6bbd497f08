//! Public error taxonomy surfaced by the client facade and the async error sink.

use std::time::Duration;

/// Error returned by a single send attempt against the ingestion endpoint.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// The request could not reach the server (DNS, connect, TLS, I/O).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The server rejected the batch with a 4xx that is not retryable (e.g. 401, 400).
    #[error("server rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
    /// The server returned a transient status (429, 5xx) worth retrying.
    #[error("transient server error, status {status}: {body}")]
    Transient { status: u16, body: String, retry_after: Option<Duration> },
    /// The batch was accepted but the server reported per-event failures.
    #[error("{failure_count} of {total} events in batch failed")]
    PartialFailure { total: usize, failure_count: usize, errors: Vec<IngestionEventError> },
    /// The response body could not be decoded.
    #[error("failed to decode response body: {0}")]
    Decode(String),
    /// The batch could not be serialized to JSON.
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether this failure is worth retrying per the classification rules in the transport layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Transient { .. })
    }

    /// Retry-After hint carried by a 429/503 response, if the server sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// One event's rejection reason inside a partial-success response.
#[derive(Debug, Clone)]
pub struct IngestionEventError {
    /// Id of the event that failed, echoed back by the server.
    pub id: String,
    /// HTTP-style status describing the failure.
    pub status: u16,
    /// Human-readable message from the server.
    pub message: String,
}

/// Error produced while constructing an observation via a builder.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// A required field was never set.
    #[error("missing required field `{field}` on {entity}")]
    MissingField { entity: &'static str, field: &'static str },
    /// A field was set to a value outside its accepted range or form.
    #[error("invalid value for `{field}` on {entity}: {reason}")]
    InvalidValue { entity: &'static str, field: &'static str, reason: String },
    /// A child observation referenced a parent id unknown to the current trace context.
    #[error("parent id `{parent_id}` is not known within this trace context")]
    UnknownParent { parent_id: String },
}

/// Error produced while constructing or validating a [`crate::config::Config`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required configuration value was neither set explicitly nor found in the environment.
    #[error("missing required config value `{0}`")]
    Missing(&'static str),
    /// A configuration value failed validation (e.g. zero capacity, malformed URL).
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Error returned by the identifier service.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdentifierError {
    /// A caller-supplied id failed the service's format constraints.
    #[error("invalid identifier `{value}`: {reason}")]
    InvalidFormat { value: String, reason: &'static str },
}

/// Unified error surfaced to library consumers: from the client facade's public methods, the
/// async error sink callback, and `Flush`'s synchronous partial-failure report.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum IngestError {
    /// A builder produced an invalid observation (strict-mode construction only).
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// The server rejected the request for authentication/authorization reasons.
    #[error("authentication failed, status {status}: {message}")]
    Auth { status: u16, message: String },
    /// The server asked the client to slow down.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    /// A transient API error survived all retry attempts.
    #[error("transient API error after {attempts} attempts: {source}")]
    TransientApi { attempts: usize, #[source] source: TransportError },
    /// The server permanently rejected the batch (non-retryable 4xx).
    #[error("permanent API error: {0}")]
    PermanentApi(TransportError),
    /// The batch was partially accepted; some events were rejected by the server.
    #[error("partial failure: {0}")]
    PartialFailure(TransportError),
    /// The event queue is full and the configured backpressure policy is `Block` or `Error`.
    #[error("event queue is full")]
    Backpressure,
    /// The client has been shut down and no longer accepts new events.
    #[error("client is closed")]
    ClientClosed,
    /// Shutdown completed but could not drain every queued event before its deadline.
    #[error("shutdown timed out with {lost_events} events still queued")]
    Shutdown { lost_events: usize },
    /// The circuit breaker is open; the send was not attempted.
    #[error("circuit breaker open: {failure_count} consecutive failures")]
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// A network-level error was not retried (retries exhausted or retry disabled).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The caller's context was already cancelled when the call was made, or was cancelled
    /// while the call was in flight.
    #[error("call cancelled")]
    Cancelled,
    /// The caller's context deadline elapsed before the call could complete.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl IngestError {
    /// Classify a [`crate::error::GuardError<TransportError>`] produced by the resilience guard
    /// stack into the public taxonomy.
    pub fn from_guard(err: crate::error::GuardError<TransportError>) -> Self {
        match err {
            crate::error::GuardError::CircuitOpen { failure_count, open_duration } => {
                Self::CircuitOpen { failure_count, open_duration }
            }
            crate::error::GuardError::Timeout { .. } => {
                Self::Transport(TransportError::Transient {
                    status: 0,
                    body: "operation timed out".into(),
                    retry_after: None,
                })
            }
            crate::error::GuardError::RetryExhausted { attempts, mut failures } => {
                let last = failures.pop().unwrap_or(TransportError::Decode("no failure recorded".into()));
                classify_exhausted(attempts, last)
            }
            crate::error::GuardError::Inner(inner) => classify_single(inner),
        }
    }
}

fn classify_exhausted(attempts: usize, source: TransportError) -> IngestError {
    match source {
        TransportError::Rejected { status, body } if status == 401 || status == 403 => {
            IngestError::Auth { status, message: body }
        }
        TransportError::PartialFailure { .. } => IngestError::PartialFailure(source),
        TransportError::Rejected { .. } => IngestError::PermanentApi(source),
        other => IngestError::TransientApi { attempts, source: other },
    }
}

fn classify_single(source: TransportError) -> IngestError {
    match source {
        TransportError::Rejected { status, body } if status == 401 || status == 403 => {
            IngestError::Auth { status, message: body }
        }
        TransportError::Transient { status, retry_after, .. } if status == 429 => {
            IngestError::RateLimited { retry_after }
        }
        TransportError::PartialFailure { .. } => IngestError::PartialFailure(source),
        TransportError::Rejected { .. } => IngestError::PermanentApi(source),
        other => IngestError::Transport(other),
    }
}
