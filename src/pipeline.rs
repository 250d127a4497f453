//! Composition of guards around one downstream call.
//!
//! Guards always apply in the same order regardless of how they were listed:
//!
//! ```text
//! rate limiter  →  bulkhead  →  circuit breaker  →  time limiter  →  call
//! ```
//!
//! Admission runs outside-in; the first refusal short-circuits and later
//! guards are never consulted. The outcome of the call (including a timeout)
//! is then reported to the circuit breaker, and the bulkhead slot is
//! released when the pipeline returns.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::bulkhead::Bulkhead;
use crate::deadline::{CancellationToken, TimeLimiter};
use crate::error::{ConfigError, GuardError, Outcome};
use crate::hook::HookRegistry;
use crate::limiter::{TokenBucketLimiter, GLOBAL_KEY};
use crate::policy::{BreakerPolicy, RatePolicy};
use crate::response::FallbackResponse;

/// One guard a pipeline can apply.
pub enum Guard<P = RatePolicy>
where
    P: BreakerPolicy,
{
    /// Per-key admission, outermost.
    RateLimiter(Arc<TokenBucketLimiter>),
    /// Concurrency admission.
    Bulkhead(Arc<Bulkhead>),
    /// Failure-aware admission.
    CircuitBreaker(CircuitBreaker<P>),
    /// Deadline around the call itself, innermost.
    TimeLimiter(Arc<TimeLimiter>),
}

impl<P> Guard<P>
where
    P: BreakerPolicy,
{
    /// Position in the fixed order, outermost first.
    pub fn precedence(&self) -> u8 {
        match self {
            Guard::RateLimiter(_) => 0,
            Guard::Bulkhead(_) => 1,
            Guard::CircuitBreaker(_) => 2,
            Guard::TimeLimiter(_) => 3,
        }
    }

    /// Kind of guard, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Guard::RateLimiter(_) => "rate limiter",
            Guard::Bulkhead(_) => "bulkhead",
            Guard::CircuitBreaker(_) => "circuit breaker",
            Guard::TimeLimiter(_) => "time limiter",
        }
    }

    /// Configured name of the guard instance.
    pub fn name(&self) -> &str {
        match self {
            Guard::RateLimiter(l) => l.name(),
            Guard::Bulkhead(b) => b.name(),
            Guard::CircuitBreaker(cb) => cb.name(),
            Guard::TimeLimiter(t) => t.name(),
        }
    }
}

impl<P> Clone for Guard<P>
where
    P: BreakerPolicy,
{
    fn clone(&self) -> Self {
        match self {
            Guard::RateLimiter(l) => Guard::RateLimiter(Arc::clone(l)),
            Guard::Bulkhead(b) => Guard::Bulkhead(Arc::clone(b)),
            Guard::CircuitBreaker(cb) => Guard::CircuitBreaker(cb.clone()),
            Guard::TimeLimiter(t) => Guard::TimeLimiter(Arc::clone(t)),
        }
    }
}

/// Turns a failed outcome into the value returned to the caller.
///
/// Implementations must be total: every [`GuardError`] variant yields a value.
pub trait FallbackResolver<T, E> {
    /// Produces the caller-facing value for `failure`.
    fn resolve(&self, failure: GuardError<E>) -> T;
}

impl<T, E, F> FallbackResolver<T, E> for F
where
    F: Fn(GuardError<E>) -> T,
{
    fn resolve(&self, failure: GuardError<E>) -> T {
        self(failure)
    }
}

/// Resolver mapping each failure to [`FallbackResponse::from_failure`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFallback;

impl<E: Display> FallbackResolver<FallbackResponse, E> for StatusFallback {
    fn resolve(&self, failure: GuardError<E>) -> FallbackResponse {
        FallbackResponse::from_failure(&failure)
    }
}

/// An ordered set of guards applied around calls.
///
/// The pipeline never retries; layer retries outside of it.
pub struct PolicyPipeline<P = RatePolicy>
where
    P: BreakerPolicy,
{
    name: String,
    guards: Vec<Guard<P>>,
    record_timeouts: bool,
    hooks: Arc<HookRegistry>,
}

impl PolicyPipeline<RatePolicy> {
    /// Starts a pipeline over breakers using the default rate policy.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<RatePolicy> {
        PipelineBuilder::new(name)
    }
}

impl<P> PolicyPipeline<P>
where
    P: BreakerPolicy,
{
    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guards in the order they are applied.
    pub fn guards(&self) -> &[Guard<P>] {
        &self.guards
    }

    /// Runs `work` through every guard using the shared rate limiter key.
    pub fn run<F, T, E>(&self, work: F) -> Outcome<T, E>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.run_keyed(GLOBAL_KEY, work)
    }

    /// Runs `work` through every guard, rate limiting under `key`.
    pub fn run_keyed<F, T, E>(&self, key: &str, work: F) -> Outcome<T, E>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut _slot = None;
        let mut breaker = None;
        let mut deadline = None;

        for guard in &self.guards {
            match guard {
                Guard::RateLimiter(limiter) => {
                    if !limiter.try_acquire(key) {
                        return Err(self.reject(guard, GuardError::RateLimited));
                    }
                }
                Guard::Bulkhead(bulkhead) => match bulkhead.try_acquire() {
                    Some(permit) => _slot = Some(permit),
                    None => return Err(self.reject(guard, GuardError::BulkheadFull)),
                },
                Guard::CircuitBreaker(cb) => match cb.acquire() {
                    Some(permit) => breaker = Some(permit),
                    None => return Err(self.reject(guard, GuardError::CircuitOpen)),
                },
                Guard::TimeLimiter(limiter) => deadline = Some(limiter),
            }
        }

        debug!(pipeline = %self.name, key, "call admitted");
        let start = Instant::now();
        let outcome = match deadline {
            Some(limiter) => limiter.run(work),
            None => work(&CancellationToken::new()).map_err(GuardError::Upstream),
        };
        let elapsed = start.elapsed();

        // A panic in `work` unwinds past this point; the permit's drop
        // records it as a failure.
        if let Some(permit) = breaker {
            match &outcome {
                Ok(_) => permit.complete(elapsed, true),
                Err(GuardError::TimedOut) if !self.record_timeouts => permit.release(),
                Err(_) => permit.complete(elapsed, false),
            }
        }

        if let Err(GuardError::TimedOut) = &outcome {
            self.hooks
                .execute_rejection_hook(self.deadline_name(), crate::error::FailureKind::TimedOut);
        }

        outcome
    }

    /// Runs `work` and resolves any failure through `fallback`.
    pub fn execute<F, T, E, R>(&self, work: F, fallback: &R) -> T
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        R: FallbackResolver<T, E> + ?Sized,
    {
        self.execute_keyed(GLOBAL_KEY, work, fallback)
    }

    /// Runs `work` rate limited under `key` and resolves any failure through `fallback`.
    pub fn execute_keyed<F, T, E, R>(&self, key: &str, work: F, fallback: &R) -> T
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        R: FallbackResolver<T, E> + ?Sized,
    {
        match self.run_keyed(key, work) {
            Ok(value) => value,
            Err(failure) => fallback.resolve(failure),
        }
    }

    fn reject<E>(&self, guard: &Guard<P>, failure: GuardError<E>) -> GuardError<E> {
        warn!(
            pipeline = %self.name,
            guard = guard.kind(),
            name = guard.name(),
            kind = %failure.kind(),
            "call rejected"
        );
        self.hooks.execute_rejection_hook(guard.name(), failure.kind());
        failure
    }

    fn deadline_name(&self) -> &str {
        self.guards
            .iter()
            .find(|g| matches!(g, Guard::TimeLimiter(_)))
            .map_or(self.name.as_str(), Guard::name)
    }
}

/// Collects guards for a [`PolicyPipeline`].
pub struct PipelineBuilder<P = RatePolicy>
where
    P: BreakerPolicy,
{
    name: String,
    guards: Vec<Guard<P>>,
    record_timeouts: bool,
    hooks: Arc<HookRegistry>,
}

impl<P> PipelineBuilder<P>
where
    P: BreakerPolicy,
{
    /// Creates an empty builder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guards: Vec::new(),
            record_timeouts: true,
            hooks: Arc::new(HookRegistry::new()),
        }
    }

    /// Adds a guard. Its position is decided by the pipeline, not by call order.
    pub fn guard(mut self, guard: Guard<P>) -> Self {
        self.guards.push(guard);
        self
    }

    /// Adds a rate limiter.
    pub fn rate_limiter(self, limiter: Arc<TokenBucketLimiter>) -> Self {
        self.guard(Guard::RateLimiter(limiter))
    }

    /// Adds a bulkhead.
    pub fn bulkhead(self, bulkhead: Arc<Bulkhead>) -> Self {
        self.guard(Guard::Bulkhead(bulkhead))
    }

    /// Adds a circuit breaker.
    pub fn circuit_breaker(self, breaker: CircuitBreaker<P>) -> Self {
        self.guard(Guard::CircuitBreaker(breaker))
    }

    /// Adds a time limiter.
    pub fn time_limiter(self, limiter: Arc<TimeLimiter>) -> Self {
        self.guard(Guard::TimeLimiter(limiter))
    }

    /// Whether timed-out calls count as breaker failures. Defaults to true.
    pub fn record_timeouts(mut self, record: bool) -> Self {
        self.record_timeouts = record;
        self
    }

    /// Sets hooks fired on every rejection.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Orders the guards and builds the pipeline.
    pub fn build(mut self) -> Result<PolicyPipeline<P>, ConfigError> {
        self.guards.sort_by_key(Guard::precedence);
        if let Some(pair) = self
            .guards
            .windows(2)
            .find(|pair| pair[0].precedence() == pair[1].precedence())
        {
            return Err(ConfigError::DuplicateGuard(pair[0].kind()));
        }

        Ok(PolicyPipeline {
            name: self.name,
            guards: self.guards,
            record_timeouts: self.record_timeouts,
            hooks: self.hooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BulkheadConfig, RateLimiterConfig, TimeLimiterConfig, WindowKind};
    use crate::error::FailureKind;
    use crate::state::State;
    use std::thread;
    use std::time::Duration;

    fn limiter(limit: u32) -> Arc<TokenBucketLimiter> {
        let config = RateLimiterConfig {
            limit_for_period: limit,
            refresh_period: Duration::from_secs(60),
            timeout: Duration::ZERO,
        };
        Arc::new(TokenBucketLimiter::new("limiter", config).unwrap())
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::builder()
            .name("breaker")
            .failure_rate_threshold(0.5)
            .minimum_calls(2)
            .window(WindowKind::CountBased { size: 4 })
            .wait_duration_in_open(Duration::from_secs(60))
            .build()
            .unwrap()
    }

    fn time_limiter(ms: u64) -> Arc<TimeLimiter> {
        let config = TimeLimiterConfig {
            timeout: Duration::from_millis(ms),
            cancel_running: true,
        };
        Arc::new(TimeLimiter::new("deadline", config).unwrap())
    }

    #[test]
    fn orders_guards_by_precedence() {
        let bulkhead = Arc::new(Bulkhead::new("bulkhead", BulkheadConfig::default()).unwrap());
        let pipeline = PolicyPipeline::builder("p")
            .time_limiter(time_limiter(100))
            .circuit_breaker(breaker())
            .bulkhead(bulkhead)
            .rate_limiter(limiter(1))
            .build()
            .unwrap();

        let order: Vec<u8> = pipeline.guards().iter().map(Guard::precedence).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_duplicate_guards() {
        let result = PolicyPipeline::builder("p")
            .rate_limiter(limiter(1))
            .rate_limiter(limiter(2))
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateGuard("rate limiter"))
        ));
    }

    #[test]
    fn rate_limit_short_circuits_inner_guards() {
        let cb = breaker();
        let pipeline = PolicyPipeline::builder("p")
            .rate_limiter(limiter(1))
            .circuit_breaker(cb.clone())
            .build()
            .unwrap();

        let first: Outcome<u8, String> = pipeline.run(|_| Ok(1));
        assert_eq!(first.ok(), Some(1));
        let second: Outcome<u8, String> = pipeline.run(|_| Ok(2));
        assert!(matches!(second, Err(GuardError::RateLimited)));
        assert_eq!(cb.metrics().calls, 1);
    }

    #[test]
    fn keyed_limits_are_independent() {
        let pipeline = PolicyPipeline::builder("p")
            .rate_limiter(limiter(1))
            .build()
            .unwrap();

        assert!(pipeline.run_keyed::<_, _, ()>("user_1", |_| Ok(())).is_ok());
        assert!(pipeline.run_keyed::<_, _, ()>("user_2", |_| Ok(())).is_ok());
        assert!(pipeline.run_keyed::<_, _, ()>("user_1", |_| Ok(())).is_err());
    }

    #[test]
    fn timeouts_count_as_breaker_failures() {
        let cb = breaker();
        let pipeline = PolicyPipeline::builder("p")
            .circuit_breaker(cb.clone())
            .time_limiter(time_limiter(20))
            .build()
            .unwrap();

        for _ in 0..2 {
            let outcome: Outcome<(), String> = pipeline.run(|_| {
                thread::sleep(Duration::from_millis(200));
                Ok(())
            });
            assert!(matches!(outcome, Err(GuardError::TimedOut)));
        }
        assert_eq!(cb.current_state(), State::Open);

        let refused: Outcome<(), String> = pipeline.run(|_| Ok(()));
        assert!(matches!(refused, Err(GuardError::CircuitOpen)));
    }

    #[test]
    fn timeouts_can_be_left_out_of_breaker_accounting() {
        let cb = breaker();
        let pipeline = PolicyPipeline::builder("p")
            .circuit_breaker(cb.clone())
            .time_limiter(time_limiter(20))
            .record_timeouts(false)
            .build()
            .unwrap();

        for _ in 0..3 {
            let _: Outcome<(), String> = pipeline.run(|_| {
                thread::sleep(Duration::from_millis(100));
                Ok(())
            });
        }
        assert_eq!(cb.current_state(), State::Closed);
        assert_eq!(cb.metrics().calls, 0);
    }

    #[test]
    fn fallback_maps_each_kind() {
        let pipeline = PolicyPipeline::builder("p")
            .rate_limiter(limiter(1))
            .build()
            .unwrap();

        let ok = pipeline.execute(|_| Ok::<_, String>(FallbackResponse::ok("done")), &StatusFallback);
        assert_eq!(ok.code, 200);

        let limited =
            pipeline.execute(|_| Ok::<_, String>(FallbackResponse::ok("done")), &StatusFallback);
        assert_eq!(limited.code, 429);
        assert!(limited.message.contains("rate limiter"));
    }

    #[test]
    fn closures_are_fallback_resolvers() {
        let pipeline = PolicyPipeline::builder("p").build().unwrap();
        let fallback = |failure: GuardError<String>| match failure.kind() {
            FailureKind::Upstream => -1,
            _ => -2,
        };
        let value: i32 = pipeline.execute(|_| Err("down".to_string()), &fallback);
        assert_eq!(value, -1);
    }

    #[test]
    fn rejection_hooks_fire_with_guard_name() {
        let hooks = HookRegistry::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        hooks.set_on_rejected(move |name, kind| s.lock().push((name.to_string(), kind)));

        let pipeline = PolicyPipeline::builder("p")
            .rate_limiter(limiter(1))
            .hooks(hooks)
            .build()
            .unwrap();
        let _: Outcome<(), ()> = pipeline.run(|_| Ok(()));
        let _: Outcome<(), ()> = pipeline.run(|_| Ok(()));

        assert_eq!(
            seen.lock().as_slice(),
            &[("limiter".to_string(), FailureKind::RateLimited)]
        );
    }

    #[test]
    fn panicking_trial_call_does_not_wedge_the_breaker() {
        let cb = CircuitBreaker::builder()
            .name("breaker")
            .minimum_calls(1)
            .window(WindowKind::CountBased { size: 2 })
            .wait_duration_in_open(Duration::from_millis(50))
            .permitted_calls_in_half_open(1)
            .build()
            .unwrap();
        let pipeline = PolicyPipeline::builder("p")
            .circuit_breaker(cb.clone())
            .build()
            .unwrap();

        let tripped: Outcome<(), String> = pipeline.run(|_| Err("down".to_string()));
        assert!(matches!(tripped, Err(GuardError::Upstream(_))));
        assert_eq!(cb.current_state(), State::Open);
        thread::sleep(Duration::from_millis(60));

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Outcome<(), String> = pipeline.run(|_| panic!("boom"));
        }));
        assert!(panicked.is_err());
        assert_eq!(cb.current_state(), State::Open);

        thread::sleep(Duration::from_millis(60));
        let recovered: Outcome<u8, String> = pipeline.run(|_| Ok(7));
        assert_eq!(recovered.ok(), Some(7));
        assert_eq!(cb.current_state(), State::Closed);
    }

    #[test]
    fn panic_under_deadline_still_records_the_call() {
        let cb = breaker();
        let pipeline = PolicyPipeline::builder("p")
            .circuit_breaker(cb.clone())
            .time_limiter(time_limiter(500))
            .build()
            .unwrap();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Outcome<(), String> = pipeline.run(|_| panic!("boom"));
        }));
        assert!(panicked.is_err());

        let metrics = cb.metrics();
        assert_eq!(metrics.calls, 1);
        assert_eq!(metrics.failed_calls, 1);
    }
}
