//! L1 in-process cache (spec §4.1): an ordered map with LRU replacement,
//! per-entry TTL, and prefix invalidation. Grounded on
//! `caddy::enterprise::cache::tier::LruCache`'s promote-on-get shape, but
//! uses the `lru` crate's `LruCache` directly for ordering rather than a
//! hand-rolled access-order `Vec`.

use crate::config::L1Config;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    inserted_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct L1Stats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl L1Stats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Sub-millisecond in-process cache bounded by `max_entries`.
pub struct L1Cache {
    inner: Mutex<LruCache<String, Entry>>,
    config: L1Config,
    stats: Mutex<L1Stats>,
}

impl L1Cache {
    pub fn new(config: L1Config) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            config,
            stats: Mutex::new(L1Stats::default()),
        }
    }

    /// Present-and-fresh entries are promoted to most-recently-used;
    /// expired entries are evicted lazily and counted as a miss.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let hit = match inner.get(key) {
            Some(entry) if entry.is_expired() => None,
            Some(entry) => Some(entry.value.clone()),
            None => None,
        };
        if hit.is_none() && inner.peek(key).is_some() {
            inner.pop(key);
            if self.config.enable_stats {
                self.stats.lock().expirations += 1;
            }
        }
        if self.config.enable_stats {
            let mut stats = self.stats.lock();
            if hit.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
        hit
    }

    /// Inserting above capacity evicts the least-recently-used entry first.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| Duration::from_millis(self.config.default_ttl_ms));
        let mut inner = self.inner.lock();
        let was_full = inner.len() >= inner.cap().get() && !inner.contains(key);
        inner.put(
            key.to_string(),
            Entry {
                value: value.to_string(),
                inserted_at: Instant::now(),
                ttl,
            },
        );
        if self.config.enable_stats {
            let mut stats = self.stats.lock();
            stats.sets += 1;
            if was_full {
                stats.evictions += 1;
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.lock().pop(key).is_some();
        if removed && self.config.enable_stats {
            self.stats.lock().deletes += 1;
        }
        removed
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Deletes every key whose string representation starts with `prefix`.
    pub fn invalidate_by_pattern(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let matching: Vec<String> = inner
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &matching {
            inner.pop(key);
        }
        matching.len()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn stats(&self) -> L1Stats {
        *self.stats.lock()
    }

    /// Proactive sweep of expired entries, intended to be driven by a
    /// periodic background task at `cleanup_interval_ms`.
    pub fn cleanup(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        if self.config.enable_stats && !expired.is_empty() {
            self.stats.lock().expirations += expired.len() as u64;
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_capacity(n: usize) -> L1Cache {
        L1Cache::new(L1Config {
            max_entries: n,
            default_ttl_ms: 60_000,
            cleanup_interval_ms: 30_000,
            enable_stats: true,
        })
    }

    #[test]
    fn set_then_get_returns_value() {
        let cache = cache_with_capacity(10);
        cache.set("k", "v", None);
        assert_eq!(cache.get("k"), Some("v".to_string()));
    }

    #[test]
    fn eviction_respects_capacity_bound() {
        let cache = cache_with_capacity(2);
        cache.set("a", "1", None);
        cache.set("b", "2", None);
        cache.set("c", "3", None);
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn least_recently_accessed_is_evicted_first() {
        let cache = cache_with_capacity(2);
        cache.set("a", "1", None);
        cache.set("b", "2", None);
        // touch "a" so "b" becomes least-recent
        cache.get("a");
        cache.set("c", "3", None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some("1".to_string()));
        assert_eq!(cache.get("c"), Some("3".to_string()));
    }

    #[test]
    fn expired_entry_is_absent_and_counted_as_miss() {
        let cache = cache_with_capacity(10);
        cache.set("k", "v", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn invalidate_by_pattern_deletes_prefixed_keys() {
        let cache = cache_with_capacity(10);
        cache.set("lb:user:1", "a", None);
        cache.set("lb:user:2", "b", None);
        cache.set("lb:guild:1", "c", None);
        let count = cache.invalidate_by_pattern("lb:user:");
        assert_eq!(count, 2);
        assert!(cache.get("lb:guild:1").is_some());
    }

    #[test]
    fn hit_rate_reflects_hits_and_misses() {
        let cache = cache_with_capacity(10);
        cache.set("k", "v", None);
        cache.get("k");
        cache.get("missing");
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    proptest::proptest! {
        #[test]
        fn size_never_exceeds_capacity(keys in proptest::collection::vec(0..50u32, 0..200)) {
            let cache = cache_with_capacity(8);
            for k in keys {
                cache.set(&k.to_string(), "v", None);
                proptest::prop_assert!(cache.size() <= 8);
            }
        }
    }
}
