//! Per-key token bucket rate limiter with fixed-window refill.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::RateLimiterConfig;
use crate::error::{ConfigError, FailureKind, GuardError, Outcome};
use crate::metrics::{MetricSink, NullMetricSink};

/// Key used when a limiter guards a single shared resource.
pub const GLOBAL_KEY: &str = "";

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    cycle: u64,
}

impl Bucket {
    /// Refills if `cycle` started since the last refill, then takes a token.
    fn take(&mut self, limit: u32, cycle: u64) -> bool {
        if self.cycle < cycle {
            self.tokens = limit;
            self.cycle = cycle;
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

/// Admits at most `limit_for_period` calls per key per refresh period.
///
/// Periods are aligned to the limiter's creation time and shared by every key.
/// At each boundary a key's bucket is refilled to the full limit, so a burst
/// of the whole limit is allowed right after a boundary. A key seen for the
/// first time starts with a full bucket. Keys are never evicted.
pub struct TokenBucketLimiter {
    name: String,
    config: RateLimiterConfig,
    origin: Instant,
    buckets: Mutex<AHashMap<String, Bucket>>,
    metric_sink: Arc<dyn MetricSink>,
}

impl TokenBucketLimiter {
    /// Creates a limiter after validating `config`.
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            origin: Instant::now(),
            buckets: Mutex::new(AHashMap::new()),
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

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Takes a permit for `key`, waiting up to the configured timeout for the
    /// next refill when the bucket is empty.
    ///
    /// Returns false right away when the next refill is further away than
    /// the remaining wait budget.
    pub fn try_acquire(&self, key: &str) -> bool {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let now = Instant::now();
            match self.poll(key, now) {
                Ok(()) => return true,
                Err(until_refill) if now + until_refill <= deadline => {
                    debug!(limiter = %self.name, key, wait = ?until_refill, "waiting for refill");
                    thread::sleep(until_refill);
                }
                Err(_) => return self.reject(key),
            }
        }
    }

    /// Takes a permit for `key` only if one is available right now.
    pub fn try_acquire_now(&self, key: &str) -> bool {
        match self.poll(key, Instant::now()) {
            Ok(()) => true,
            Err(_) => self.reject(key),
        }
    }

    /// Permits left for `key` in the current period.
    pub fn available_permits(&self, key: &str) -> u32 {
        let cycle = self.cycle_at(Instant::now());
        match self.buckets.lock().get(key) {
            Some(bucket) if bucket.cycle == cycle => bucket.tokens,
            _ => self.config.limit_for_period,
        }
    }

    /// Number of distinct keys seen so far.
    pub fn key_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Runs `f` if a permit for `key` is granted.
    pub fn call<F, T, E>(&self, key: &str, f: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.try_acquire(key) {
            return Err(GuardError::RateLimited);
        }
        f().map_err(GuardError::Upstream)
    }

    /// Takes a token or reports how long until the next refill.
    fn poll(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let cycle = self.cycle_at(now);
        let limit = self.config.limit_for_period;
        let taken = {
            let mut buckets = self.buckets.lock();
            match buckets.get_mut(key) {
                Some(bucket) => bucket.take(limit, cycle),
                None => {
                    let mut bucket = Bucket { tokens: limit, cycle };
                    let taken = bucket.take(limit, cycle);
                    buckets.insert(key.to_owned(), bucket);
                    taken
                }
            }
        };

        if taken {
            Ok(())
        } else {
            Err(self.boundary(cycle + 1).saturating_duration_since(now))
        }
    }

    fn cycle_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.config.refresh_period.as_nanos()) as u64
    }

    fn boundary(&self, cycle: u64) -> Instant {
        let nanos = self.config.refresh_period.as_nanos() * u128::from(cycle);
        self.origin + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn reject(&self, key: &str) -> bool {
        warn!(
            limiter = %self.name,
            key,
            limit = self.config.limit_for_period,
            period = ?self.config.refresh_period,
            "rate limit exceeded"
        );
        self.metric_sink
            .record_rejection(&self.name, FailureKind::RateLimited);
        false
    }
}

#[cfg(feature = "async")]
impl TokenBucketLimiter {
    /// Like [`TokenBucketLimiter::try_acquire`], but sleeps on the tokio timer.
    pub async fn try_acquire_async(&self, key: &str) -> bool {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let now = Instant::now();
            match self.poll(key, now) {
                Ok(()) => return true,
                Err(until_refill) if now + until_refill <= deadline => {
                    tokio::time::sleep(until_refill).await;
                }
                Err(_) => return self.reject(key),
            }
        }
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}
