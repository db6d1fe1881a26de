use criterion::{black_box, criterion_group, criterion_main, Criterion};
use resilience_rs::{CircuitBreaker, CircuitBreakerFactory};
use std::error::Error;
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
struct BenchError(String);

impl BenchError {
    fn new(msg: &str) -> Self {
        BenchError(msg.to_string())
    }
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Benchmark error: {}", self.0)
    }
}

impl Error for BenchError {}

fn successful_operation() -> Result<(), BenchError> {
    Ok(())
}

fn failing_operation() -> Result<(), BenchError> {
    Err(BenchError::new("Simulated failure"))
}

fn bench_circuit_breaker_closed(c: &mut Criterion) {
    let breaker = CircuitBreaker::builder("bench-closed")
        .failure_threshold(50.0)
        .reset_timeout(Duration::from_secs(30))
        .build();

    c.bench_function("circuit_breaker_closed_success", |b| {
        b.iter(|| black_box(breaker.call(successful_operation)));
    });
}

fn bench_circuit_breaker_transition(c: &mut Criterion) {
    let breaker = CircuitBreaker::builder("bench-transition")
        .failure_threshold(50.0)
        .sliding_window_size(5)
        .minimum_requests(5)
        .reset_timeout(Duration::from_secs(30))
        .build();

    c.bench_function("circuit_breaker_transition", |b| {
        b.iter_custom(|iters| {
            let start = std::time::Instant::now();

            for _ in 0..iters {
                // Start every iteration closed with an empty window.
                breaker.close();

                for _ in 0..5 {
                    let _ = black_box(breaker.call(failing_operation));
                }

                // One open-circuit rejection
                let _ = black_box(breaker.call(successful_operation));
            }

            start.elapsed()
        });
    });
}

fn bench_circuit_breaker_concurrent(c: &mut Criterion) {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let breaker = CircuitBreaker::builder("bench-concurrent")
        .failure_threshold(50.0)
        .sliding_window_size(100)
        .build();

    const THREAD_COUNT: usize = 4;
    const ITERATIONS_PER_THREAD: usize = 1000;

    c.bench_function("circuit_breaker_concurrent", |b| {
        b.iter(|| {
            let barrier = Arc::new(Barrier::new(THREAD_COUNT + 1));
            let mut handles = Vec::with_capacity(THREAD_COUNT);

            for _ in 0..THREAD_COUNT {
                let thread_breaker = breaker.clone();
                let thread_barrier = Arc::clone(&barrier);

                handles.push(thread::spawn(move || {
                    thread_barrier.wait();
                    for _ in 0..ITERATIONS_PER_THREAD {
                        let _ = black_box(thread_breaker.call(successful_operation));
                    }
                }));
            }

            barrier.wait();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

fn bench_factory_lookup(c: &mut Criterion) {
    let factory = CircuitBreakerFactory::new();
    for name in ["payment", "email", "database", "search-api", "ledger"] {
        factory.get_or_create(name);
    }

    c.bench_function("factory_get_or_create_existing", |b| {
        b.iter(|| black_box(factory.get_or_create(black_box("search-api"))));
    });
}

criterion_group!(
    benches,
    bench_circuit_breaker_closed,
    bench_circuit_breaker_transition,
    bench_circuit_breaker_concurrent,
    bench_factory_lookup
);
criterion_main!(benches);
