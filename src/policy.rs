//! Policy engine for circuit breaker trip and reset decisions.

use std::time::Duration;

use crate::config::BreakerConfig;
use crate::window::WindowSummary;

/// Decides when a circuit breaker trips and when it recovers.
///
/// The breaker owns the state machine and window bookkeeping; a policy only
/// looks at window totals. A failed trial call while half-open always reopens
/// the circuit regardless of policy.
pub trait BreakerPolicy: Send + Sync + 'static {
    /// Whether a call of this duration counts as slow.
    fn is_slow(&self, duration: Duration) -> bool;

    /// Whether a closed circuit should open given its current window.
    fn should_trip(&self, summary: &WindowSummary) -> bool;

    /// Whether a half-open circuit should close once all trial calls completed.
    fn should_close(&self, trials: &WindowSummary) -> bool;
}

/// Trips on failure rate or slow-call rate once enough calls were observed.
#[derive(Debug, Clone, PartialEq)]
pub struct RatePolicy {
    failure_rate_threshold: f64,
    slow_call_rate_threshold: f64,
    slow_call_duration_threshold: Duration,
    minimum_calls: u64,
}

impl RatePolicy {
    /// Creates a new rate policy.
    pub fn new(
        failure_rate_threshold: f64,
        slow_call_rate_threshold: f64,
        slow_call_duration_threshold: Duration,
        minimum_calls: u64,
    ) -> Self {
        Self {
            failure_rate_threshold,
            slow_call_rate_threshold,
            slow_call_duration_threshold,
            minimum_calls,
        }
    }

    /// Takes the thresholds from a breaker configuration.
    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.failure_rate_threshold,
            config.slow_call_rate_threshold,
            config.slow_call_duration_threshold,
            config.minimum_calls,
        )
    }

    fn exceeds_thresholds(&self, summary: &WindowSummary) -> bool {
        summary.failure_rate() >= self.failure_rate_threshold
            || summary.slow_call_rate() >= self.slow_call_rate_threshold
    }
}

impl BreakerPolicy for RatePolicy {
    fn is_slow(&self, duration: Duration) -> bool {
        duration > self.slow_call_duration_threshold
    }

    fn should_trip(&self, summary: &WindowSummary) -> bool {
        summary.calls >= self.minimum_calls && self.exceeds_thresholds(summary)
    }

    fn should_close(&self, trials: &WindowSummary) -> bool {
        !self.exceeds_thresholds(trials)
    }
}
