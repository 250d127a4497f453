//! Re-exports the types most callers need.
//!
//! # Example
//! ```rust,no_run
//! use callguard::prelude::*;
//!
//! let pipeline: PolicyPipeline = PolicyPipeline::builder("inventory").build().unwrap();
//! let outcome: Outcome<u32, String> = pipeline.run(|_token| Ok(1));
//! ```

pub use crate::{
    Bulkhead, BulkheadConfig, CancellationToken, CircuitBreaker, ConfigError, FailureKind,
    FallbackResolver, FallbackResponse, GuardError, Outcome, PolicyPipeline, RateLimiterConfig,
    ResultCache, State, StatusFallback, TimeLimiter, TimeLimiterConfig, TokenBucketLimiter,
};
