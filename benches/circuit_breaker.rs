use criterion::{black_box, criterion_group, criterion_main, Criterion};
use langfuse_core::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState, GuardError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct BenchError;

impl std::fmt::Display for BenchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "boom")
    }
}
impl std::error::Error for BenchError {}

fn circuit_breaker_throughput_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig {
        failure_threshold: 10,
        recovery_timeout: Duration::from_secs(30),
        half_open_max_calls: 1,
        success_threshold: 1,
    });

    c.bench_function("circuit_breaker_success", |b| {
        b.to_async(&rt).iter(|| async {
            let result =
                breaker.execute(|| async { Ok::<_, GuardError<BenchError>>(black_box("request")) }).await;
            let _ = black_box(result);
        });
    });
    assert_eq!(breaker.state(), CircuitState::Closed);
}

fn circuit_breaker_throughput_failure(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    // Opens on the very first failure; every subsequent call short-circuits without invoking the op.
    let breaker = CircuitBreakerPolicy::new(1, Duration::from_secs(30));

    c.bench_function("circuit_breaker_open_short_circuit", |b| {
        let calls = calls.clone();
        b.to_async(&rt).iter(|| {
            let calls = calls.clone();
            let breaker = breaker.clone();
            async move {
                let result = breaker
                    .execute(|| {
                        calls.fetch_add(1, Ordering::Relaxed);
                        async { Err::<&'static str, _>(GuardError::Inner(BenchError)) }
                    })
                    .await;
                let _ = black_box(result);
            }
        });
    });
}

criterion_group!(benches, circuit_breaker_throughput_success, circuit_breaker_throughput_failure);
criterion_main!(benches);
