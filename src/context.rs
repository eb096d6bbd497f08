//! Per-call cancellation and deadline, threaded explicitly through every public entry point
//! instead of inferred from ambient state (a global timeout constant, a lifecycle flag).
//!
//! Mirrors the `tokio_util::sync::CancellationToken` idiom used elsewhere in the ecosystem for
//! exactly this purpose (a token held alongside a `watch`-channel shutdown signal in a consumer
//! loop). The client facade's own lifecycle shutdown signal is a separate, unrelated channel; a
//! `Context` only ever bounds one call.

use std::time::Duration;
use tokio::time::Instant;
pub use tokio_util::sync::CancellationToken;

/// An optional per-call deadline plus an optional cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancellation: Option<CancellationToken>,
}

impl Context {
    /// No deadline, no cancellation: places no bound on the call at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Some(Instant::now() + timeout), cancellation: None }
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self { deadline: None, cancellation: Some(token) }
    }

    pub fn with_timeout_and_cancellation(timeout: Duration, token: CancellationToken) -> Self {
        Self { deadline: Some(Instant::now() + timeout), cancellation: Some(token) }
    }

    /// Whether this context's token (if any) has already fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|token| token.is_cancelled())
    }

    /// Time left until this context's deadline, or `None` if it carries no deadline at all.
    pub fn deadline_remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// [`Self::deadline_remaining`], or `fallback` when this context carries no deadline.
    pub fn remaining_or(&self, fallback: Duration) -> Duration {
        self.deadline_remaining().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_has_no_deadline_and_is_never_cancelled() {
        let ctx = Context::none();
        assert!(!ctx.is_cancelled());
        assert!(ctx.deadline_remaining().is_none());
        assert_eq!(ctx.remaining_or(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn with_timeout_bounds_remaining() {
        let ctx = Context::with_timeout(Duration::from_secs(10));
        let remaining = ctx.deadline_remaining().expect("deadline should be set");
        assert!(remaining <= Duration::from_secs(10));
    }

    #[test]
    fn cancellation_is_observed_after_cancel() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancellation(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
