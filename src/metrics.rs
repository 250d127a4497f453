//! Metric sinks receiving guard events.

use std::time::Duration;

use crate::error::FailureKind;
use crate::state::State;

/// Trait for metrics sinks that can receive guard events.
///
/// `name` is the configured name of the guard emitting the event.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a circuit breaker state transition.
    fn record_state_transition(&self, name: &str, from: State, to: State);

    /// Records a call refused or cut short by a guard.
    fn record_rejection(&self, name: &str, kind: FailureKind);

    /// Records a completed call.
    fn record_call(&self, name: &str, success: bool, duration: Duration);

    /// Records a cache lookup.
    fn record_cache_lookup(&self, name: &str, hit: bool);
}

/// A null metrics sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _name: &str, _from: State, _to: State) {}
    fn record_rejection(&self, _name: &str, _kind: FailureKind) {}
    fn record_call(&self, _name: &str, _success: bool, _duration: Duration) {}
    fn record_cache_lookup(&self, _name: &str, _hit: bool) {}
}

#[cfg(feature = "prometheus")]
pub use prometheus_sink::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus_sink {
    use std::time::Duration;

    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
    use prometheus_client::registry::Registry;

    use super::MetricSink;
    use crate::error::FailureKind;
    use crate::state::State;

    type Labels = Vec<(String, String)>;

    fn duration_histogram() -> Histogram {
        Histogram::new(exponential_buckets(0.001, 2.0, 14))
    }

    /// Exports guard events as Prometheus counters and histograms.
    #[derive(Clone)]
    pub struct PrometheusSink {
        transitions: Family<Labels, Counter>,
        rejections: Family<Labels, Counter>,
        calls: Family<Labels, Counter>,
        call_duration: Family<Labels, Histogram>,
        cache_lookups: Family<Labels, Counter>,
    }

    impl PrometheusSink {
        /// Creates the metric families and registers them in `registry`.
        pub fn register(registry: &mut Registry) -> Self {
            let sink = Self {
                transitions: Family::default(),
                rejections: Family::default(),
                calls: Family::default(),
                call_duration: Family::new_with_constructor(duration_histogram),
                cache_lookups: Family::default(),
            };
            registry.register(
                "callguard_state_transitions",
                "Circuit breaker state transitions",
                sink.transitions.clone(),
            );
            registry.register(
                "callguard_rejections",
                "Calls refused or cut short by a guard",
                sink.rejections.clone(),
            );
            registry.register(
                "callguard_calls",
                "Completed guarded calls",
                sink.calls.clone(),
            );
            registry.register(
                "callguard_call_duration_seconds",
                "Duration of completed guarded calls",
                sink.call_duration.clone(),
            );
            registry.register(
                "callguard_cache_lookups",
                "Result cache lookups",
                sink.cache_lookups.clone(),
            );
            sink
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, name: &str, from: State, to: State) {
            self.transitions
                .get_or_create(&labels(&[
                    ("guard", name),
                    ("from", from.as_str()),
                    ("to", to.as_str()),
                ]))
                .inc();
        }

        fn record_rejection(&self, name: &str, kind: FailureKind) {
            self.rejections
                .get_or_create(&labels(&[("guard", name), ("kind", kind.as_str())]))
                .inc();
        }

        fn record_call(&self, name: &str, success: bool, duration: Duration) {
            let outcome = if success { "success" } else { "failure" };
            let labels = labels(&[("guard", name), ("outcome", outcome)]);
            self.calls.get_or_create(&labels).inc();
            self.call_duration
                .get_or_create(&labels)
                .observe(duration.as_secs_f64());
        }

        fn record_cache_lookup(&self, name: &str, hit: bool) {
            let result = if hit { "hit" } else { "miss" };
            self.cache_lookups
                .get_or_create(&labels(&[("cache", name), ("result", result)]))
                .inc();
        }
    }

}
