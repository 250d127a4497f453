//! Core circuit breaker implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{BreakerBuilder, BreakerConfig};
use crate::error::{FailureKind, GuardError, Outcome};
use crate::hook::HookRegistry;
use crate::metrics::MetricSink;
use crate::policy::{BreakerPolicy, RatePolicy};
use crate::state::{State, StateCell};
use crate::window::{CallRecord, SlidingWindow, WindowSummary};

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerMetrics {
    /// Current state.
    pub state: State,
    /// Failure rate over the sliding window.
    pub failure_rate: f64,
    /// Slow-call rate over the sliding window.
    pub slow_call_rate: f64,
    /// Calls in the sliding window.
    pub calls: u64,
    /// Failed calls in the sliding window.
    pub failed_calls: u64,
    /// Slow calls in the sliding window.
    pub slow_calls: u64,
    /// Calls refused since the breaker was created.
    pub not_permitted_calls: u64,
}

/// Admission of one call, tied to the state it was admitted in.
///
/// A permit dropped without [`complete`](BreakerPermit::complete) or
/// [`release`](BreakerPermit::release), because the call panicked or its
/// future was dropped, is recorded as a failure.
#[must_use = "an unfinished permit is recorded as a failed call"]
pub(crate) struct BreakerPermit<'a, P>
where
    P: BreakerPolicy,
{
    breaker: &'a CircuitBreaker<P>,
    generation: u64,
    started: Instant,
    armed: bool,
}

impl<P> BreakerPermit<'_, P>
where
    P: BreakerPolicy,
{
    /// Records the outcome of the admitted call.
    pub(crate) fn complete(mut self, duration: Duration, success: bool) {
        self.armed = false;
        self.breaker.record(Some(self.generation), duration, success);
    }

    /// Gives the permit back without recording the call.
    pub(crate) fn release(mut self) {
        self.armed = false;
        let mut core = self.breaker.inner.core.lock();
        if core.state == State::HalfOpen && core.generation == self.generation {
            core.trial_permits += 1;
        }
    }
}

impl<P> Drop for BreakerPermit<'_, P>
where
    P: BreakerPolicy,
{
    fn drop(&mut self) {
        if self.armed {
            debug!(breaker = %self.breaker.inner.name, "call abandoned, recording failure");
            self.breaker
                .record(Some(self.generation), self.started.elapsed(), false);
        }
    }
}

/// Everything mutated by call outcomes. Guarded by a single lock so that
/// recording a call and evaluating the transition it causes are one step.
struct Core {
    state: State,
    entered_at: Instant,
    window: SlidingWindow,
    trials: WindowSummary,
    trial_permits: u32,
    generation: u64,
    not_permitted: u64,
}

struct Transition {
    from: State,
    to: State,
    summary: WindowSummary,
}

/// Inner state of the circuit breaker, shared between clones.
struct BreakerInner<P>
where
    P: BreakerPolicy,
{
    name: String,
    config: BreakerConfig,
    policy: P,
    core: Mutex<Core>,
    state: StateCell,
    metric_sink: Arc<dyn MetricSink>,
    hooks: Arc<HookRegistry>,
}

/// A three-state circuit breaker driven by a sliding window of call outcomes.
///
/// Open → half-open happens lazily: the first permission request after
/// `wait_duration_in_open` elapsed performs the transition and is admitted as
/// the first trial call.
pub struct CircuitBreaker<P = RatePolicy>
where
    P: BreakerPolicy,
{
    inner: Arc<BreakerInner<P>>,
}

impl CircuitBreaker<RatePolicy> {
    /// Creates a new builder for customizing a circuit breaker.
    pub fn builder() -> BreakerBuilder {
        BreakerBuilder::new()
    }
}

impl<P> CircuitBreaker<P>
where
    P: BreakerPolicy,
{
    /// Creates a new circuit breaker. Use [`CircuitBreaker::builder`] to validate the config.
    pub fn new(
        name: String,
        config: BreakerConfig,
        policy: P,
        metric_sink: Arc<dyn MetricSink>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let core = Core {
            state: State::Closed,
            entered_at: Instant::now(),
            window: SlidingWindow::from_kind(&config.window),
            trials: WindowSummary::default(),
            trial_permits: 0,
            generation: 0,
            not_permitted: 0,
        };
        let inner = BreakerInner {
            name,
            config,
            policy,
            core: Mutex::new(core),
            state: StateCell::new(State::Closed),
            metric_sink,
            hooks,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration this breaker was built with.
    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Gets the current state without taking the breaker lock.
    pub fn current_state(&self) -> State {
        self.inner.state.load()
    }

    /// Current window rates and counters.
    pub fn metrics(&self) -> BreakerMetrics {
        let mut core = self.inner.core.lock();
        let summary = core.window.summary(Instant::now());
        BreakerMetrics {
            state: core.state,
            failure_rate: summary.failure_rate(),
            slow_call_rate: summary.slow_call_rate(),
            calls: summary.calls,
            failed_calls: summary.failures,
            slow_calls: summary.slow_calls,
            not_permitted_calls: core.not_permitted,
        }
    }

    /// Asks for permission to make a call.
    ///
    /// Always true while closed, false while open, and true for at most
    /// `permitted_calls_in_half_open` callers while half-open. The caller
    /// must report the call through [`on_success`](Self::on_success) or
    /// [`on_error`](Self::on_error).
    pub fn try_acquire_permission(&self) -> bool {
        self.admit().is_some()
    }

    /// Records a successful call against the current state.
    pub fn on_success(&self, duration: Duration) {
        self.record(None, duration, true);
    }

    /// Records a failed call against the current state.
    ///
    /// The cause is logged but not kept; the window stores only the outcome
    /// and duration of each call.
    pub fn on_error(&self, duration: Duration, cause: &dyn std::error::Error) {
        debug!(breaker = %self.inner.name, error = %cause, "recording failed call");
        self.record(None, duration, false);
    }

    /// Executes a function wrapped by the circuit breaker.
    pub fn call<F, T, E>(&self, f: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let Some(permit) = self.acquire() else {
            return Err(GuardError::CircuitOpen);
        };

        let start = Instant::now();
        let result = f();
        permit.complete(start.elapsed(), result.is_ok());

        result.map_err(GuardError::Upstream)
    }

    /// Admits a call whose outcome the returned permit reports.
    pub(crate) fn acquire(&self) -> Option<BreakerPermit<'_, P>> {
        let generation = self.admit()?;
        Some(BreakerPermit {
            breaker: self,
            generation,
            started: Instant::now(),
            armed: true,
        })
    }

    /// Admits a call and returns the generation it belongs to.
    fn admit(&self) -> Option<u64> {
        let mut transition = None;
        let admitted = {
            let mut core = self.inner.core.lock();
            match core.state {
                State::Closed => Some(core.generation),
                State::Open => {
                    if core.entered_at.elapsed() >= self.inner.config.wait_duration_in_open {
                        transition = Some(self.transition(&mut core, State::HalfOpen));
                        core.trial_permits = self
                            .inner
                            .config
                            .permitted_calls_in_half_open
                            .saturating_sub(1);
                        Some(core.generation)
                    } else {
                        core.not_permitted += 1;
                        None
                    }
                }
                State::HalfOpen => {
                    if core.trial_permits > 0 {
                        core.trial_permits -= 1;
                        Some(core.generation)
                    } else {
                        core.not_permitted += 1;
                        None
                    }
                }
            }
        };

        if let Some(t) = transition {
            self.announce(t);
        }

        match admitted {
            Some(generation) => Some(generation),
            None => {
                debug!(breaker = %self.inner.name, "call not permitted");
                self.inner
                    .metric_sink
                    .record_rejection(&self.inner.name, FailureKind::CircuitOpen);
                None
            }
        }
    }

    /// Processes the result of a call to update the window and possibly change state.
    fn record(&self, generation: Option<u64>, duration: Duration, success: bool) {
        self.inner
            .metric_sink
            .record_call(&self.inner.name, success, duration);

        let now = Instant::now();
        let record = CallRecord {
            at: now,
            duration,
            success,
            slow: self.inner.policy.is_slow(duration),
        };

        let transition = {
            let mut core = self.inner.core.lock();
            // Admitted under a state that has since been left.
            if generation.is_some_and(|g| g != core.generation) {
                return;
            }
            match core.state {
                State::Closed => {
                    core.window.record(record);
                    let summary = core.window.summary(now);
                    if self.inner.policy.should_trip(&summary) {
                        Some(self.transition(&mut core, State::Open))
                    } else {
                        None
                    }
                }
                State::HalfOpen => {
                    core.trials.add(&record);
                    let trials = core.trials;
                    let permitted = u64::from(self.inner.config.permitted_calls_in_half_open);
                    if !success {
                        Some(self.transition(&mut core, State::Open))
                    } else if trials.calls >= permitted {
                        let next = if self.inner.policy.should_close(&trials) {
                            State::Closed
                        } else {
                            State::Open
                        };
                        Some(self.transition(&mut core, next))
                    } else {
                        None
                    }
                }
                State::Open => None,
            }
        };

        if let Some(t) = transition {
            self.announce(t);
        }
    }

    /// Moves to `to` with the lock held and resets per-state bookkeeping.
    fn transition(&self, core: &mut Core, to: State) -> Transition {
        let from = core.state;
        let summary = match from {
            State::HalfOpen => core.trials,
            _ => core.window.summary(Instant::now()),
        };

        core.state = to;
        core.entered_at = Instant::now();
        core.generation += 1;
        core.trials = WindowSummary::default();
        core.trial_permits = 0;
        if to == State::Closed || to == State::Open {
            core.window.clear();
        }
        self.inner.state.store(to);

        Transition { from, to, summary }
    }

    /// Logs and publishes a transition once the lock is released.
    fn announce(&self, t: Transition) {
        info!(
            breaker = %self.inner.name,
            from = %t.from,
            to = %t.to,
            failure_rate = t.summary.failure_rate(),
            slow_call_rate = t.summary.slow_call_rate(),
            calls = t.summary.calls,
            "circuit breaker state transition"
        );
        self.inner
            .metric_sink
            .record_state_transition(&self.inner.name, t.from, t.to);
        self.inner.hooks.execute_state_transition_hook(t.from, t.to);
    }
}

// Allow cloning of circuit breakers - cheap because inner state is Arc'd
impl<P> Clone for CircuitBreaker<P>
where
    P: BreakerPolicy,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for CircuitBreaker<P>
where
    P: BreakerPolicy,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.current_state())
            .finish()
    }
}

// Implement Async support when the feature is enabled
#[cfg(feature = "async")]
impl<P> CircuitBreaker<P>
where
    P: BreakerPolicy,
{
    /// Executes an async function wrapped by the circuit breaker.
    pub async fn call_async<F, Fut, T, E>(&self, f: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.acquire() else {
            return Err(GuardError::CircuitOpen);
        };

        let start = Instant::now();
        let result = f().await;
        permit.complete(start.elapsed(), result.is_ok());

        result.map_err(GuardError::Upstream)
    }
}
