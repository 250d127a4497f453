//! Advanced example
//!
//! This example demonstrates:
//! 1. Composing every guard into one pipeline
//! 2. Using hooks for monitoring breaker transitions and rejections
//! 3. Resolving each failure kind into a status response
//! 4. Edge-tier admission and backend selection

use callguard::{
    Bulkhead, BulkheadConfig, CircuitBreaker, DeterministicSelector, EdgeChain, EdgeDecision,
    FallbackResponse, HookRegistry, PathGateConfig, PathRateGate, PolicyPipeline,
    RateLimiterConfig, StatusFallback, TimeLimiter, TimeLimiterConfig, TokenAuthFilter,
    TokenBucketLimiter,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("service error: {0}")]
struct ServiceError(&'static str);

// Simulates a provider that degrades and then recovers
fn provider_call(attempt: u32) -> Result<FallbackResponse, ServiceError> {
    match attempt {
        1..=3 => Ok(FallbackResponse::ok("initial success")),
        4..=6 => Err(ServiceError("provider unavailable")),
        7..=8 => {
            thread::sleep(Duration::from_millis(1500));
            Ok(FallbackResponse::ok("too slow"))
        }
        _ => Ok(FallbackResponse::ok("stable success")),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Advanced Example ===\n");

    let breaker_hooks = HookRegistry::new();
    breaker_hooks.set_on_open(|| println!("  circuit OPENED"));
    breaker_hooks.set_on_half_open(|| println!("  circuit HALF-OPEN, probing"));
    breaker_hooks.set_on_close(|| println!("  circuit CLOSED"));

    let pipeline_hooks = HookRegistry::new();
    pipeline_hooks.set_on_rejected(|name, kind| println!("  {name} rejected: {kind}"));

    let breaker = CircuitBreaker::builder()
        .name("provider")
        .config(callguard::BreakerConfig::failure_and_slow_call())
        .minimum_calls(4)
        .wait_duration_in_open(Duration::from_secs(2))
        .hooks(breaker_hooks)
        .build()?;

    let pipeline = PolicyPipeline::builder("provider")
        .time_limiter(Arc::new(TimeLimiter::new(
            "provider",
            TimeLimiterConfig::default(),
        )?))
        .circuit_breaker(breaker.clone())
        .bulkhead(Arc::new(Bulkhead::new("provider", BulkheadConfig::default())?))
        .rate_limiter(Arc::new(TokenBucketLimiter::new(
            "provider",
            RateLimiterConfig {
                limit_for_period: 20,
                ..RateLimiterConfig::default()
            },
        )?))
        .hooks(pipeline_hooks)
        .build()?;

    let attempt = Arc::new(AtomicU32::new(0));
    for i in 1..=12 {
        let attempt = Arc::clone(&attempt);
        let response = pipeline.execute(
            move |_token| provider_call(attempt.fetch_add(1, Ordering::SeqCst) + 1),
            &StatusFallback,
        );
        println!(
            "call {i}: {} {} [{}]",
            response.code,
            response.message,
            breaker.current_state()
        );
        thread::sleep(Duration::from_millis(300));
    }

    println!("\n--- Edge tier ---");
    let chain = EdgeChain::new()
        .with_auth(TokenAuthFilter::default())
        .with_gate(PathRateGate::new(PathGateConfig::default())?);
    let requests: [(&str, &[(&str, &str)]); 3] = [
        ("/provider1/api/hello", &[("Authorization", "Bearer demo")]),
        ("/provider1/api/hello", &[("Authorization", "Bearer invalid-token")]),
        ("/public/status", &[]),
    ];
    for (path, headers) in requests {
        match chain.handle(path, headers) {
            EdgeDecision::Continue => println!("{path}: forwarded"),
            EdgeDecision::Respond(response) => println!("{path}: {}", response.to_json()),
        }
    }

    let selector = DeterministicSelector::new();
    let backends = ["provider-1:8081", "provider-2:8082", "provider-3:8083"];
    if let Some(backend) = selector.select_local(&backends) {
        println!(
            "\n{} routes to {backend}",
            DeterministicSelector::local_identity()
        );
    }

    println!("\n=== Example Completed ===");
    Ok(())
}
