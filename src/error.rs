//! Composition error for the retry / circuit-breaker / timeout guard stack.
//!
//! This is the error type the resilience primitives ([`crate::retry::RetryPolicy`],
//! [`crate::circuit_breaker::CircuitBreakerPolicy`], [`crate::timeout::TimeoutPolicy`]) are
//! generic over. The operation they guard is sending one batch through
//! [`crate::transport::Transport`], whose own error type is [`crate::ingest_error::TransportError`];
//! `GuardError<E>` wraps that and adds the policy layer's own failure modes on top so callers can
//! tell "the batch was rejected by the server" apart from "the circuit breaker refused to even try".

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type for the retry / circuit-breaker / timeout guard stack.
#[derive(Debug)]
pub enum GuardError<E> {
    /// The operation exceeded the timeout duration.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker is open.
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The underlying send failed.
    Inner(E),
}

impl<E: Clone> Clone for GuardError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Timeout { elapsed, timeout } => Self::Timeout { elapsed: *elapsed, timeout: *timeout },
            Self::CircuitOpen { failure_count, open_duration } => {
                Self::CircuitOpen { failure_count: *failure_count, open_duration: *open_duration }
            }
            Self::RetryExhausted { attempts, failures } => {
                Self::RetryExhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: PartialEq> PartialEq for GuardError<E> {
    fn eq(&self, other: &Self) -> bool {
        use GuardError::*;
        match (self, other) {
            (Timeout { elapsed: a1, timeout: b1 }, Timeout { elapsed: a2, timeout: b2 }) => a1 == a2 && b1 == b2,
            (
                CircuitOpen { failure_count: f1, open_duration: d1 },
                CircuitOpen { failure_count: f2, open_duration: d2 },
            ) => f1 == f2 && d1 == d2,
            (RetryExhausted { attempts: a1, failures: f1 }, RetryExhausted { attempts: a2, failures: f2 }) => {
                a1 == a2 && f1 == f2
            }
            (Inner(e1), Inner(e2)) => e1 == e2,
            _ => false,
        }
    }
}

impl<E: Eq> Eq for GuardError<E> {}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "send timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { failure_count, open_duration } => {
                write!(f, "circuit breaker open ({} failures, open for {:?})", failure_count, open_duration)
            }
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retry exhausted after {} attempts ({} failures), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => failures.last().map(|e| e as &dyn std::error::Error),
            _ => None,
        }
    }
}

impl<E> GuardError<E> {
    /// Check if this error is due to timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to the circuit breaker being open.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to retry exhaustion.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error wraps an inner send error directly (not via retry exhaustion).
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error, preferring the last recorded retry failure if exhausted.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { mut failures, .. } => failures.pop(),
            _ => None,
        }
    }

    /// Access all recorded failures for RetryExhausted, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// Borrow the inner error if present (directly, not via retry exhaustion).
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
