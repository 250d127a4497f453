//! # callguard
//!
//! Per-call fault tolerance for outbound requests: rate limiting, bulkheads,
//! circuit breaking and deadlines composed around a single call, plus a
//! result cache, a deterministic backend selector and edge-tier admission.
//!
//! Every guard works on process-local state and is safe to share between
//! threads. Guards are built once with fixed configuration and handed to a
//! [`PolicyPipeline`], which applies them in a fixed order:
//!
//! - **Rate limiter**: at most N calls per key per period.
//! - **Bulkhead**: at most C calls in flight.
//! - **Circuit breaker**: refuses calls while the recent failure or slow-call
//!   rate is too high, then probes with a few trial calls.
//! - **Time limiter**: gives up on calls that run past their deadline.
//!
//! Each guarded call ends in exactly one [`Outcome`]: the value, or a
//! [`GuardError`] naming which guard refused it or how the call failed.
//!
//! ## Basic Usage
//!
//! ```rust
//! use callguard::{
//!     CircuitBreaker, FallbackResponse, PolicyPipeline, RateLimiterConfig, StatusFallback,
//!     TokenBucketLimiter,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let limiter = TokenBucketLimiter::new("orders", RateLimiterConfig::default())?;
//! let breaker = CircuitBreaker::builder()
//!     .name("orders")
//!     .failure_rate_threshold(0.5)
//!     .wait_duration_in_open(Duration::from_secs(5))
//!     .build()?;
//!
//! let pipeline = PolicyPipeline::builder("orders")
//!     .rate_limiter(Arc::new(limiter))
//!     .circuit_breaker(breaker)
//!     .build()?;
//!
//! let response = pipeline.execute(
//!     |_token| Ok::<_, String>(FallbackResponse::ok("order placed")),
//!     &StatusFallback,
//! );
//! assert_eq!(response.code, 200);
//! # Ok::<(), callguard::ConfigError>(())
//! ```
//!
//! ## Async Support
//!
//! With the `async` feature enabled, the breaker and time limiter accept futures:
//!
//! ```rust,ignore
//! let result = breaker.call_async(|| async { Ok::<_, String>("done") }).await;
//! let result = limiter.run_async(|token| async move { fetch(token).await }).await;
//! ```
//!
//! ## Features
//!
//! - `std` - Standard library support (default)
//! - `async` - Async support with Tokio
//! - `prometheus` - Prometheus metrics integration

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod breaker;
mod bulkhead;
mod cache;
mod config;
mod deadline;
mod edge;
mod error;
mod hook;
mod limiter;
mod metrics;
mod pipeline;
mod policy;
pub mod prelude;
mod response;
mod selector;
mod state;
mod window;

// Re-exports
pub use breaker::{BreakerMetrics, CircuitBreaker};
pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use cache::{Cached, ResultCache};
pub use config::{
    AuthConfig, BreakerBuilder, BreakerConfig, BulkheadConfig, PathGateConfig, RateLimiterConfig,
    TimeLimiterConfig, WindowKind,
};
pub use deadline::{CancellationToken, TimeLimiter};
pub use edge::{EdgeChain, EdgeDecision, PathRateGate, TokenAuthFilter};
pub use error::{ConfigError, FailureKind, GuardError, Outcome};
pub use hook::HookRegistry;
pub use limiter::{TokenBucketLimiter, GLOBAL_KEY};
#[cfg(feature = "prometheus")]
pub use metrics::PrometheusSink;
pub use metrics::{MetricSink, NullMetricSink};
pub use pipeline::{FallbackResolver, Guard, PipelineBuilder, PolicyPipeline, StatusFallback};
pub use policy::{BreakerPolicy, RatePolicy};
pub use response::{EdgeResponse, FallbackResponse};
pub use selector::{DeterministicSelector, FALLBACK_IDENTITY};
pub use state::State;
pub use window::{CallRecord, SlidingWindow, WindowSummary};
