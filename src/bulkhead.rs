//! Bounded-concurrency admission gate.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::config::BulkheadConfig;
use crate::error::{ConfigError, FailureKind, GuardError, Outcome};
use crate::metrics::{MetricSink, NullMetricSink};

#[derive(Debug, Default)]
struct Slots {
    in_flight: usize,
    waiting: usize,
}

/// Limits how many calls run at once.
///
/// Callers beyond `max_concurrent_calls` wait up to `max_wait` for a slot and
/// are then refused with [`GuardError::BulkheadFull`].
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    slots: Mutex<Slots>,
    freed: Condvar,
    metric_sink: Arc<dyn MetricSink>,
}

/// A held bulkhead slot, released when dropped.
///
/// Dropping happens on every exit path of the guarded call, including
/// unwinding, so a slot can neither leak nor be released twice.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        self.bulkhead.release();
    }
}

impl Bulkhead {
    /// Creates a bulkhead after validating `config`.
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            slots: Mutex::new(Slots::default()),
            freed: Condvar::new(),
            metric_sink: Arc::new(NullMetricSink),
        })
    }

    /// Sends rejections to `sink`.
    pub fn with_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this bulkhead was built with.
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().in_flight
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.config.max_concurrent_calls - self.in_flight()
    }

    /// Callers currently waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.slots.lock().waiting
    }

    /// Takes a slot, waiting up to `max_wait` for one to free up.
    pub fn try_acquire(&self) -> Option<BulkheadPermit<'_>> {
        let max = self.config.max_concurrent_calls;
        let mut slots = self.slots.lock();

        if slots.in_flight < max {
            slots.in_flight += 1;
            return Some(BulkheadPermit { bulkhead: self });
        }

        if !self.config.max_wait.is_zero() {
            let deadline = Instant::now() + self.config.max_wait;
            slots.waiting += 1;
            loop {
                let timed_out = self.freed.wait_until(&mut slots, deadline).timed_out();
                if slots.in_flight < max {
                    slots.waiting -= 1;
                    slots.in_flight += 1;
                    return Some(BulkheadPermit { bulkhead: self });
                }
                if timed_out {
                    break;
                }
            }
            slots.waiting -= 1;
        }

        let in_flight = slots.in_flight;
        drop(slots);
        warn!(
            bulkhead = %self.name,
            in_flight,
            max_concurrent_calls = max,
            "bulkhead is full"
        );
        self.metric_sink
            .record_rejection(&self.name, FailureKind::BulkheadFull);
        None
    }

    /// Runs `f` while holding a slot.
    pub fn call<F, T, E>(&self, f: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let Some(_permit) = self.try_acquire() else {
            return Err(GuardError::BulkheadFull);
        };
        f().map_err(GuardError::Upstream)
    }

    fn release(&self) {
        let mut slots = self.slots.lock();
        slots.in_flight -= 1;
        drop(slots);
        self.freed.notify_one();
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn bulkhead(max: usize, wait_ms: u64) -> Bulkhead {
        Bulkhead::new(
            "test",
            BulkheadConfig {
                max_concurrent_calls: max,
                max_wait: Duration::from_millis(wait_ms),
            },
        )
        .unwrap()
    }

    #[test]
    fn permits_release_on_drop() {
        let bulkhead = bulkhead(2, 0);
        let a = bulkhead.try_acquire();
        let b = bulkhead.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(bulkhead.try_acquire().is_none());

        drop(a);
        assert_eq!(bulkhead.in_flight(), 1);
        assert!(bulkhead.try_acquire().is_some());
        assert_eq!(bulkhead.in_flight(), 1);
    }

    #[test]
    fn waiter_gets_slot_freed_within_budget() {
        let bulkhead = bulkhead(1, 500);
        let barrier = Barrier::new(2);

        thread::scope(|s| {
            let holder = bulkhead.try_acquire().unwrap();
            s.spawn(|| {
                barrier.wait();
                assert!(bulkhead.try_acquire().is_some());
            });
            barrier.wait();
            thread::sleep(Duration::from_millis(30));
            drop(holder);
        });
        assert_eq!(bulkhead.in_flight(), 0);
        assert_eq!(bulkhead.waiting(), 0);
    }

    #[test]
    fn gives_up_after_max_wait() {
        let bulkhead = bulkhead(1, 30);
        let _held = bulkhead.try_acquire().unwrap();
        let start = Instant::now();
        assert!(bulkhead.try_acquire().is_none());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(30));
        assert!(waited < Duration::from_millis(500));
    }

    #[test]
    fn slot_is_released_when_the_call_panics() {
        let bulkhead = bulkhead(1, 0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Outcome<(), ()> = bulkhead.call(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(bulkhead.in_flight(), 0);
    }

    #[test]
    fn call_maps_failures() {
        let bulkhead = bulkhead(1, 0);
        let held = bulkhead.try_acquire();
        let refused: Outcome<(), &str> = bulkhead.call(|| Ok(()));
        assert!(matches!(refused, Err(GuardError::BulkheadFull)));
        drop(held);

        let failed: Outcome<(), &str> = bulkhead.call(|| Err("down"));
        assert!(matches!(failed, Err(GuardError::Upstream("down"))));
    }
}
