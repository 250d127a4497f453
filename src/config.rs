//! Construction-time configuration for every guard.
//!
//! All values are fixed once a guard is built. The structs derive serde so an
//! external loader can fill them in; the defaults mirror a typical consumer
//! deployment (5 calls per 2 s, 10 concurrent calls, 1 s deadline, ...).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreaker;
use crate::error::ConfigError;
use crate::hook::HookRegistry;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::policy::{BreakerPolicy, RatePolicy};

/// Shape of a circuit breaker's sliding window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowKind {
    /// The last `size` calls.
    CountBased {
        /// Number of calls kept.
        size: usize,
    },
    /// Calls completed within the last `window`, aggregated into `buckets`.
    TimeBased {
        /// Length of the window.
        window: Duration,
        /// Number of buckets the window is split into.
        buckets: u32,
    },
}

impl Default for WindowKind {
    fn default() -> Self {
        WindowKind::TimeBased {
            window: Duration::from_secs(10),
            buckets: 10,
        }
    }
}

/// Circuit breaker thresholds.
///
/// Rates are fractions in `(0, 1]`. A `slow_call_rate_threshold` of `1.0`
/// only trips when every call in the window was slow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failure rate at or above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Slow-call rate at or above which the breaker opens.
    pub slow_call_rate_threshold: f64,
    /// Calls taking longer than this count as slow.
    pub slow_call_duration_threshold: Duration,
    /// Observation window.
    pub window: WindowKind,
    /// Calls required in the window before rates are evaluated.
    pub minimum_calls: u64,
    /// Time spent open before trial calls are let through.
    pub wait_duration_in_open: Duration,
    /// Trial calls permitted while half-open.
    pub permitted_calls_in_half_open: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::failure_rate_only()
    }
}

impl BreakerConfig {
    /// 30 % failure rate over a 10 s window, slow calls ignored.
    pub fn failure_rate_only() -> Self {
        Self {
            failure_rate_threshold: 0.3,
            slow_call_rate_threshold: 1.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            window: WindowKind::default(),
            minimum_calls: 5,
            wait_duration_in_open: Duration::from_secs(5),
            permitted_calls_in_half_open: 3,
        }
    }

    /// 50 % failure rate or 30 % of calls slower than 2 s over a 10 s window.
    pub fn failure_and_slow_call() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            slow_call_rate_threshold: 0.3,
            slow_call_duration_threshold: Duration::from_secs(2),
            ..Self::failure_rate_only()
        }
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_rate("failure_rate_threshold", self.failure_rate_threshold)?;
        check_rate("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        if self.permitted_calls_in_half_open == 0 {
            return Err(ConfigError::Zero("permitted_calls_in_half_open"));
        }
        if self.minimum_calls == 0 {
            return Err(ConfigError::Zero("minimum_calls"));
        }
        match self.window {
            WindowKind::CountBased { size: 0 } => Err(ConfigError::Zero("window.size")),
            WindowKind::TimeBased { buckets: 0, .. } => Err(ConfigError::Zero("window.buckets")),
            WindowKind::TimeBased { window, .. } if window.is_zero() => {
                Err(ConfigError::ZeroDuration("window.window"))
            }
            _ => Ok(()),
        }
    }
}

fn check_rate(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::RateOutOfRange { name, value })
    }
}

/// Token bucket limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Permits granted per key at the start of every period.
    pub limit_for_period: u32,
    /// Length of one refill period.
    pub refresh_period: Duration,
    /// Longest a caller may wait for the next refill. Zero never waits.
    pub timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 5,
            refresh_period: Duration::from_secs(2),
            timeout: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    /// Per-entity limiting: 2 calls per second per key, 500 ms wait.
    pub fn hot_parameter() -> Self {
        Self {
            limit_for_period: 2,
            refresh_period: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
        }
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::Zero("limit_for_period"));
        }
        if self.refresh_period.is_zero() {
            return Err(ConfigError::ZeroDuration("refresh_period"));
        }
        Ok(())
    }
}

/// Bulkhead settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Calls allowed in flight at once.
    pub max_concurrent_calls: usize,
    /// Longest a caller may wait for a free slot. Zero never waits.
    pub max_wait: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            max_wait: Duration::from_millis(20),
        }
    }
}

impl BulkheadConfig {
    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::Zero("max_concurrent_calls"));
        }
        Ok(())
    }
}

/// Time limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLimiterConfig {
    /// Deadline applied to every call.
    pub timeout: Duration,
    /// Whether to signal the call's cancellation token on expiry.
    pub cancel_running: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            cancel_running: true,
        }
    }
}

impl TimeLimiterConfig {
    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("timeout"));
        }
        Ok(())
    }
}

/// Path-keyed gate settings for the edge tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathGateConfig {
    /// Length of one counting window.
    pub window: Duration,
    /// Requests allowed per window for paths without a specific limit.
    pub default_limit: u64,
    /// `(prefix, limit)` pairs; the longest matching prefix wins.
    pub path_limits: Vec<(String, u64)>,
}

impl Default for PathGateConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            default_limit: 100,
            path_limits: vec![
                ("/provider1/api".to_string(), 50),
                ("/provider2/api".to_string(), 80),
            ],
        }
    }
}

impl PathGateConfig {
    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::ZeroDuration("window"));
        }
        Ok(())
    }
}

/// Bearer-token check settings for the edge tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Paths containing any of these fragments skip the check.
    pub public_markers: Vec<String>,
    /// Tokens that are always refused.
    pub denied_tokens: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_markers: vec!["/public/".to_string(), "/open/".to_string()],
            denied_tokens: vec!["invalid-token".to_string()],
        }
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder {
    name: String,
    config: BreakerConfig,
    metric_sink: Arc<dyn MetricSink>,
    hook_registry: Arc<HookRegistry>,
}

impl Default for BreakerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            name: "default".to_string(),
            config: BreakerConfig::default(),
            metric_sink: Arc::new(NullMetricSink),
            hook_registry: Arc::new(HookRegistry::new()),
        }
    }

    /// Sets the name used in logs and metrics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the failure rate that trips the circuit.
    pub fn failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.config.failure_rate_threshold = threshold;
        self
    }

    /// Sets the slow-call rate that trips the circuit.
    pub fn slow_call_rate_threshold(mut self, threshold: f64) -> Self {
        self.config.slow_call_rate_threshold = threshold;
        self
    }

    /// Sets the duration above which a call is slow.
    pub fn slow_call_duration_threshold(mut self, duration: Duration) -> Self {
        self.config.slow_call_duration_threshold = duration;
        self
    }

    /// Sets the sliding window shape.
    pub fn window(mut self, window: WindowKind) -> Self {
        self.config.window = window;
        self
    }

    /// Sets the number of calls required before rates are evaluated.
    pub fn minimum_calls(mut self, calls: u64) -> Self {
        self.config.minimum_calls = calls;
        self
    }

    /// Sets the time spent open before the circuit goes half-open.
    pub fn wait_duration_in_open(mut self, duration: Duration) -> Self {
        self.config.wait_duration_in_open = duration;
        self
    }

    /// Sets the number of trial calls allowed while half-open.
    pub fn permitted_calls_in_half_open(mut self, calls: u32) -> Self {
        self.config.permitted_calls_in_half_open = calls;
        self
    }

    /// Sets a metric sink for the circuit breaker.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Shares an existing metric sink with the circuit breaker.
    pub fn shared_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Sets a hook registry for the circuit breaker.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hook_registry = Arc::new(hooks);
        self
    }

    /// Builds a circuit breaker evaluating the configured rates.
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        self.config.validate()?;
        let policy = RatePolicy::from_config(&self.config);
        Ok(self.finish(policy))
    }

    /// Builds a circuit breaker that delegates trip decisions to `policy`.
    pub fn build_with_policy<P: BreakerPolicy>(
        self,
        policy: P,
    ) -> Result<CircuitBreaker<P>, ConfigError> {
        self.config.validate()?;
        Ok(self.finish(policy))
    }

    fn finish<P: BreakerPolicy>(self, policy: P) -> CircuitBreaker<P> {
        CircuitBreaker::new(
            self.name,
            self.config,
            policy,
            self.metric_sink,
            self.hook_registry,
        )
    }
}
