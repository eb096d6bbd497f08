//! Composes retry, circuit breaker and timeout into the single guard applied to every batch send.
//!
//! Order (outside-in): Retry → CircuitBreaker → Timeout → send. Retry sits outermost so a
//! CircuitOpen rejection (not an `Inner` error) is not retried; the circuit breaker sits outside
//! the timeout so a slow-but-eventually-failing send still counts toward its failure budget.

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::GuardError;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;
use std::future::Future;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct GuardStack<E> {
    pub(crate) retry: RetryPolicy<E>,
    pub(crate) circuit_breaker: CircuitBreakerPolicy,
    pub(crate) timeout: TimeoutPolicy,
}

impl<E> GuardStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(retry: RetryPolicy<E>, circuit_breaker: CircuitBreakerPolicy, timeout: TimeoutPolicy) -> Self {
        Self { retry, circuit_breaker, timeout }
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, GuardError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, GuardError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op_cell = Arc::new(Mutex::new(operation));

        self.retry
            .execute(|| {
                let op = op_cell.clone();
                let circuit_breaker = self.circuit_breaker.clone();
                let timeout = self.timeout.clone();
                async move {
                    circuit_breaker
                        .execute(|| {
                            let op = op.clone();
                            let timeout = timeout.clone();
                            async move {
                                timeout
                                    .execute(|| {
                                        let mut op = op.lock().expect("guard stack operation mutex poisoned");
                                        op()
                                    })
                                    .await
                            }
                        })
                        .await
                }
            })
            .await
    }

    pub fn circuit_breaker(&self) -> &CircuitBreakerPolicy {
        &self.circuit_breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn success_passes_through_all_layers() {
        let stack = GuardStack::new(
            RetryPolicy::builder().max_attempts(3).unwrap().with_sleeper(InstantSleeper).build(),
            CircuitBreakerPolicy::new(5, Duration::from_secs(30)),
            TimeoutPolicy::new(Duration::from_secs(1)).unwrap(),
        );

        let result = stack.execute(|| async { Ok::<_, GuardError<TestError>>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retry_recovers_transient_failure_before_circuit_opens() {
        let stack = GuardStack::new(
            RetryPolicy::builder().max_attempts(3).unwrap().with_sleeper(InstantSleeper).build(),
            CircuitBreakerPolicy::new(5, Duration::from_secs(30)),
            TimeoutPolicy::new(Duration::from_secs(1)).unwrap(),
        );

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result = stack
            .execute(|| {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(GuardError::Inner(TestError("transient".into())))
                    } else {
                        Ok(99)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 99);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn circuit_open_short_circuits_without_retrying() {
        let breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(60));
        let stack = GuardStack::new(
            RetryPolicy::builder().max_attempts(3).unwrap().with_sleeper(InstantSleeper).build(),
            breaker,
            TimeoutPolicy::new(Duration::from_secs(1)).unwrap(),
        );

        let _ = stack.execute(|| async { Err::<(), _>(GuardError::Inner(TestError("fail".into()))) }).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = stack
            .execute(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, GuardError<TestError>>(1)
                }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "circuit should short-circuit before the send runs");
    }
}
