//! TTL-keyed cache of prior call results.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::metrics::{MetricSink, NullMetricSink};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) <= self.ttl
    }
}

/// A value served by [`ResultCache::get_or_compute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<V> {
    /// The cached or freshly computed value.
    pub value: V,
    /// Whether `value` came from the cache.
    pub from_cache: bool,
}

/// Caches call results for a per-entry time to live.
///
/// Expiry is lazy: an entry older than its TTL is treated as absent on read
/// whether or not it was physically removed; [`ResultCache::purge_expired`]
/// reclaims memory. Concurrent misses on one key may each run the supplier,
/// and the last writer wins. Values are cloned out whole, never torn.
pub struct ResultCache<K, V> {
    name: String,
    entries: RwLock<AHashMap<K, CacheEntry<V>>>,
    metric_sink: Arc<dyn MetricSink>,
}

impl<K, V> ResultCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Creates an empty cache.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(AHashMap::new()),
            metric_sink: Arc::new(NullMetricSink),
        }
    }

    /// Sends hit/miss events to `sink`.
    pub fn with_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the live value for `key`, if any.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.write().insert(key, entry);
    }

    /// Returns the live value for `key` or computes, stores and returns a new one.
    ///
    /// The supplier runs without any lock held. A failed supplier caches nothing.
    pub fn get_or_compute<F, E>(&self, key: K, ttl: Duration, supplier: F) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get(&key) {
            debug!(cache = %self.name, "cache hit");
            self.metric_sink.record_cache_lookup(&self.name, true);
            return Ok(Cached {
                value,
                from_cache: true,
            });
        }

        debug!(cache = %self.name, "cache miss");
        self.metric_sink.record_cache_lookup(&self.name, false);
        let value = supplier()?;
        self.insert(key, value.clone(), ttl);
        Ok(Cached {
            value,
            from_cache: false,
        })
    }

    /// Removes `key`. Returns whether a live entry was removed.
    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .write()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Drops every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K, V> std::fmt::Debug for ResultCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("name", &self.name)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::thread;

    #[test]
    fn second_lookup_is_served_from_cache() {
        let cache: ResultCache<String, u64> = ResultCache::new("users");
        let calls = Cell::new(0);
        let supplier = || -> Result<u64, ()> {
            calls.set(calls.get() + 1);
            Ok(42)
        };

        let first = cache
            .get_or_compute("user_1".to_string(), Duration::from_secs(5), supplier)
            .unwrap();
        let second = cache
            .get_or_compute("user_1".to_string(), Duration::from_secs(5), supplier)
            .unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.value, 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn expired_entries_are_recomputed() {
        let cache: ResultCache<&str, u64> = ResultCache::new("users");
        cache.insert("k", 1, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get("k"), None);
        let fresh = cache
            .get_or_compute("k", Duration::from_secs(1), || Ok::<_, ()>(2))
            .unwrap();
        assert_eq!(fresh, Cached { value: 2, from_cache: false });
    }

    #[test]
    fn failures_are_not_cached() {
        let cache: ResultCache<&str, u64> = ResultCache::new("users");
        let err = cache.get_or_compute("k", Duration::from_secs(1), || Err("down"));
        assert_eq!(err, Err("down"));
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_reports_live_removal() {
        let cache: ResultCache<String, u64> = ResultCache::new("users");
        cache.insert("user_7".to_string(), 7, Duration::from_secs(60));
        assert!(cache.invalidate("user_7"));
        assert!(!cache.invalidate("user_7"));
        assert_eq!(cache.get("user_7"), None);
    }

    #[test]
    fn purge_drops_only_expired() {
        let cache: ResultCache<u32, u32> = ResultCache::new("users");
        cache.insert(1, 1, Duration::from_millis(10));
        cache.insert(2, 2, Duration::from_secs(60));
        thread::sleep(Duration::from_millis(25));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some(2));
    }
}
