//! Sliding windows of call records used by the circuit breaker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::config::WindowKind;

/// One completed call as seen by a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    /// When the call completed.
    pub at: Instant,
    /// How long the call took.
    pub duration: Duration,
    /// Whether the call succeeded.
    pub success: bool,
    /// Whether the call exceeded the slow-call threshold.
    pub slow: bool,
}

/// Aggregated counts over the records currently inside a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSummary {
    /// Number of calls in the window.
    pub calls: u64,
    /// Number of failed calls in the window.
    pub failures: u64,
    /// Number of slow calls (successful or not) in the window.
    pub slow_calls: u64,
}

impl WindowSummary {
    /// Fraction of calls that failed, `0.0` for an empty window.
    pub fn failure_rate(&self) -> f64 {
        ratio(self.failures, self.calls)
    }

    /// Fraction of calls that were slow, `0.0` for an empty window.
    pub fn slow_call_rate(&self) -> f64 {
        ratio(self.slow_calls, self.calls)
    }

    pub(crate) fn add(&mut self, record: &CallRecord) {
        self.calls += 1;
        self.failures += u64::from(!record.success);
        self.slow_calls += u64::from(record.slow);
    }

    fn remove(&mut self, record: &CallRecord) {
        self.calls -= 1;
        self.failures -= u64::from(!record.success);
        self.slow_calls -= u64::from(record.slow);
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    index: u64,
    summary: WindowSummary,
}

#[derive(Debug)]
enum Inner {
    Count {
        records: VecDeque<CallRecord>,
        capacity: usize,
        totals: WindowSummary,
    },
    Time {
        buckets: SmallVec<[Bucket; 16]>,
        origin: Instant,
        bucket_size: Duration,
        bucket_count: u64,
    },
}

/// Bounded history of recent calls.
///
/// Count-based windows keep the last `size` records; time-based windows keep
/// per-bucket totals for the last `window` of wall-clock time. Not
/// synchronized: the owner serializes access.
#[derive(Debug)]
pub struct SlidingWindow {
    inner: Inner,
}

impl SlidingWindow {
    /// Creates a window keeping the last `capacity` calls.
    pub fn count_based(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Inner::Count {
                records: VecDeque::with_capacity(capacity),
                capacity,
                totals: WindowSummary::default(),
            },
        }
    }

    /// Creates a window covering `window`, split into `buckets` equal buckets.
    pub fn time_based(window: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1);
        let bucket_size = (window / buckets).max(Duration::from_millis(1));
        Self {
            inner: Inner::Time {
                buckets: SmallVec::new(),
                origin: Instant::now(),
                bucket_size,
                bucket_count: u64::from(buckets),
            },
        }
    }

    /// Creates the window described by `kind`.
    pub fn from_kind(kind: &WindowKind) -> Self {
        match *kind {
            WindowKind::CountBased { size } => Self::count_based(size),
            WindowKind::TimeBased { window, buckets } => Self::time_based(window, buckets),
        }
    }

    /// Adds a record, evicting the oldest data on overflow.
    pub fn record(&mut self, record: CallRecord) {
        match &mut self.inner {
            Inner::Count {
                records,
                capacity,
                totals,
            } => {
                if records.len() == *capacity {
                    if let Some(evicted) = records.pop_front() {
                        totals.remove(&evicted);
                    }
                }
                totals.add(&record);
                records.push_back(record);
            }
            Inner::Time {
                buckets,
                origin,
                bucket_size,
                bucket_count,
            } => {
                let index = bucket_index(*origin, *bucket_size, record.at);
                evict_buckets(buckets, index, *bucket_count);
                match buckets.last_mut() {
                    Some(bucket) if bucket.index == index => bucket.summary.add(&record),
                    _ => {
                        let mut summary = WindowSummary::default();
                        summary.add(&record);
                        buckets.push(Bucket { index, summary });
                    }
                }
            }
        }
    }

    /// Totals over everything still inside the window at `now`.
    pub fn summary(&mut self, now: Instant) -> WindowSummary {
        match &mut self.inner {
            Inner::Count { totals, .. } => *totals,
            Inner::Time {
                buckets,
                origin,
                bucket_size,
                bucket_count,
            } => {
                evict_buckets(buckets, bucket_index(*origin, *bucket_size, now), *bucket_count);
                buckets.iter().fold(WindowSummary::default(), |mut acc, b| {
                    acc.calls += b.summary.calls;
                    acc.failures += b.summary.failures;
                    acc.slow_calls += b.summary.slow_calls;
                    acc
                })
            }
        }
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        match &mut self.inner {
            Inner::Count {
                records, totals, ..
            } => {
                records.clear();
                *totals = WindowSummary::default();
            }
            Inner::Time { buckets, .. } => buckets.clear(),
        }
    }
}

fn bucket_index(origin: Instant, bucket_size: Duration, at: Instant) -> u64 {
    let elapsed = at.saturating_duration_since(origin);
    (elapsed.as_nanos() / bucket_size.as_nanos()) as u64
}

fn evict_buckets(buckets: &mut SmallVec<[Bucket; 16]>, current: u64, bucket_count: u64) {
    let oldest_live = current.saturating_sub(bucket_count - 1);
    buckets.retain(|b| b.index >= oldest_live);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn rec(success: bool, slow: bool) -> CallRecord {
        CallRecord {
            at: Instant::now(),
            duration: Duration::from_millis(1),
            success,
            slow,
        }
    }

    #[test]
    fn count_window_evicts_oldest() {
        let mut window = SlidingWindow::count_based(3);
        window.record(rec(false, false));
        window.record(rec(true, false));
        window.record(rec(true, true));
        let summary = window.summary(Instant::now());
        assert_eq!(summary.calls, 3);
        assert_eq!(summary.failures, 1);

        // Pushes the failure out.
        window.record(rec(true, false));
        let summary = window.summary(Instant::now());
        assert_eq!(summary.calls, 3);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.slow_calls, 1);
    }

    #[test]
    fn rates_on_empty_window_are_zero() {
        let mut window = SlidingWindow::count_based(10);
        let summary = window.summary(Instant::now());
        assert_eq!(summary.failure_rate(), 0.0);
        assert_eq!(summary.slow_call_rate(), 0.0);
    }

    #[test]
    fn time_window_forgets_old_buckets() {
        let mut window = SlidingWindow::time_based(Duration::from_millis(100), 4);
        window.record(rec(false, false));
        window.record(rec(false, false));
        assert_eq!(window.summary(Instant::now()).failures, 2);

        thread::sleep(Duration::from_millis(150));
        window.record(rec(true, false));
        let summary = window.summary(Instant::now());
        assert_eq!(summary.calls, 1);
        assert_eq!(summary.failure_rate(), 0.0);
    }

    #[test]
    fn clear_resets_totals() {
        let mut window = SlidingWindow::count_based(4);
        window.record(rec(false, true));
        window.clear();
        assert_eq!(window.summary(Instant::now()), WindowSummary::default());
    }
}
