//! Basic usage: one circuit breaker, one per-user rate limiter and a cache.

use callguard::{
    CircuitBreaker, GuardError, RateLimiterConfig, ResultCache, TokenBucketLimiter, WindowKind,
};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("service error: {0}")]
struct ServiceError(String);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let breaker = CircuitBreaker::builder()
        .name("provider")
        .failure_rate_threshold(0.5) // 50% failure rate will trip circuit
        .minimum_calls(4)
        .window(WindowKind::CountBased { size: 10 })
        .wait_duration_in_open(Duration::from_secs(1))
        .permitted_calls_in_half_open(2)
        .build()?;

    println!("Circuit initial state: {}", breaker.current_state());

    let mut counter = 0u32;
    let mut call_service = || -> Result<String, ServiceError> {
        counter += 1;
        // Fail on even counts for the first ten calls, then recover
        if counter <= 10 && counter % 2 == 0 {
            Err(ServiceError("external service error".to_string()))
        } else {
            Ok(format!("response #{counter}"))
        }
    };

    for i in 1..=15 {
        print!("Attempt {i}: ");
        match breaker.call(&mut call_service) {
            Ok(result) => println!("succeeded with {result}"),
            Err(GuardError::CircuitOpen) => {
                println!("circuit is open, waiting before retry");
                thread::sleep(Duration::from_millis(600));
            }
            Err(err) => println!("{err}"),
        }

        let metrics = breaker.metrics();
        println!(
            "  state={}, failure_rate={:.2}, calls={}",
            metrics.state, metrics.failure_rate, metrics.calls
        );
        thread::sleep(Duration::from_millis(100));
    }

    // Hot-parameter limiting: each user gets their own budget
    let limiter = TokenBucketLimiter::new("user-lookup", RateLimiterConfig::hot_parameter())?;
    let cache: ResultCache<String, String> = ResultCache::new("users");
    for id in [1, 1, 1, 2] {
        let key = format!("user_{id}");
        if !limiter.try_acquire_now(&key) {
            println!("{key}: rate limited");
            continue;
        }
        let user = cache.get_or_compute(key.clone(), Duration::from_secs(60), || {
            Ok::<_, ServiceError>(format!("profile of {key}"))
        })?;
        println!("{key}: {} (cached: {})", user.value, user.from_cache);
    }

    Ok(())
}
