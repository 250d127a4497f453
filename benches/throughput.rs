use callguard::{
    Bulkhead, BulkheadConfig, CircuitBreaker, DeterministicSelector, PolicyPipeline,
    RateLimiterConfig, ResultCache, TokenBucketLimiter, WindowKind,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("benchmark error: {0}")]
struct BenchError(&'static str);

fn successful_operation() -> Result<(), BenchError> {
    Ok(())
}

fn failing_operation() -> Result<(), BenchError> {
    Err(BenchError("simulated failure"))
}

fn roomy_limiter() -> TokenBucketLimiter {
    let config = RateLimiterConfig {
        limit_for_period: u32::MAX,
        refresh_period: Duration::from_secs(3600),
        timeout: Duration::ZERO,
    };
    TokenBucketLimiter::new("bench", config).unwrap()
}

fn bench_circuit_breaker_closed(c: &mut Criterion) {
    let breaker = CircuitBreaker::builder()
        .failure_rate_threshold(0.5)
        .wait_duration_in_open(Duration::from_secs(30))
        .build()
        .unwrap();

    c.bench_function("circuit_breaker_closed_success", |b| {
        b.iter(|| black_box(breaker.call(successful_operation)));
    });
}

fn bench_circuit_breaker_open(c: &mut Criterion) {
    let breaker = CircuitBreaker::builder()
        .minimum_calls(1)
        .window(WindowKind::CountBased { size: 1 })
        .wait_duration_in_open(Duration::from_secs(3600))
        .build()
        .unwrap();
    let _ = breaker.call(failing_operation);

    c.bench_function("circuit_breaker_open_rejection", |b| {
        b.iter(|| black_box(breaker.call(successful_operation)));
    });
}

fn bench_limiter_keys(c: &mut Criterion) {
    let limiter = roomy_limiter();
    let keys: Vec<String> = (0..64).map(|i| format!("user_{i}")).collect();

    c.bench_function("limiter_try_acquire_64_keys", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(limiter.try_acquire_now(&keys[i]))
        });
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let pipeline = PolicyPipeline::builder("bench")
        .rate_limiter(Arc::new(roomy_limiter()))
        .bulkhead(Arc::new(
            Bulkhead::new("bench", BulkheadConfig::default()).unwrap(),
        ))
        .circuit_breaker(CircuitBreaker::builder().build().unwrap())
        .build()
        .unwrap();

    c.bench_function("pipeline_inline_success", |b| {
        b.iter(|| black_box(pipeline.run(|_| successful_operation())));
    });
}

fn bench_cache_and_selector(c: &mut Criterion) {
    let cache: ResultCache<String, u64> = ResultCache::new("bench");
    cache.insert("user_1".to_string(), 1, Duration::from_secs(3600));
    c.bench_function("cache_hit", |b| {
        b.iter(|| black_box(cache.get("user_1")));
    });

    let selector = DeterministicSelector::new();
    let backends = ["b1", "b2", "b3", "b4"];
    c.bench_function("selector_select", |b| {
        b.iter(|| black_box(selector.select("host-A", &backends)));
    });
}

fn bench_circuit_breaker_concurrent(c: &mut Criterion) {
    let breaker = CircuitBreaker::builder()
        .minimum_calls(u64::MAX) // High to avoid tripping
        .wait_duration_in_open(Duration::from_secs(30))
        .build()
        .unwrap();

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

            // Start all threads simultaneously
            barrier.wait();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_circuit_breaker_closed,
    bench_circuit_breaker_open,
    bench_limiter_keys,
    bench_pipeline,
    bench_cache_and_selector,
    bench_circuit_breaker_concurrent
);
criterion_main!(benches);
