//! Multi-layer cache facade (spec §4.3): L1→L2→miss read path, dual write,
//! and pub/sub-driven L1 invalidation. Grounded on
//! `caddy::enterprise::cache::tier::MultiTierCache`'s promotion orchestration,
//! adapted from three tiers to this spec's L1/L2 plus compute-on-miss.

use super::l1::L1Cache;
use super::l2::{L2Cache, INVALIDATION_CHANNEL};
use crate::config::MultiLayerConfig;
use crate::substrate::SharedStore;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayer {
    L1,
    L2,
    Miss,
}

#[derive(Debug)]
pub struct CacheResult<T> {
    pub value: Option<T>,
    pub layer: CacheLayer,
    pub latency_ms: f64,
}

/// `L1.get/set/delete` and the invalidator's history append are
/// non-blocking (spec §5); only L2 calls suspend on the shared KV.
pub struct MultiLayerCache {
    l1: Arc<L1Cache>,
    l2: Arc<L2Cache>,
    config: MultiLayerConfig,
}

impl MultiLayerCache {
    pub fn new(store: Arc<dyn SharedStore>, config: MultiLayerConfig) -> Self {
        let l1 = Arc::new(L1Cache::new(config.l1.clone()));
        let l2 = Arc::new(L2Cache::new(store, config.l2.clone(), config.namespace.clone()));
        Self { l1, l2, config }
    }

    /// Spawns the background task that subscribes to the invalidation
    /// channel and invalidates this replica's L1 on receipt — the
    /// "pub/sub-driven L1 invalidation" half of the write path (spec §4.3).
    /// Returns a handle the caller should abort on shutdown (spec §9: the
    /// subscription must be explicitly torn down).
    pub fn spawn_invalidation_listener(self: &Arc<Self>, store: Arc<dyn SharedStore>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = match store.subscribe(INVALIDATION_CHANNEL).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!(error = %e, "failed to subscribe to cache invalidation channel");
                    return;
                }
            };
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if let Ok(event) = serde_json::from_str::<serde_json::Value>(&msg.payload) {
                            if let Some(pattern) = event.get("pattern").and_then(|p| p.as_str()) {
                                let count = cache.l1.invalidate_by_pattern(pattern);
                                tracing::debug!(pattern, count, "L1 invalidated from broadcast");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "invalidation listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<T> {
        let start = Instant::now();
        if let Some(raw) = self.l1.get(key) {
            if let Ok(value) = serde_json::from_str(&raw) {
                return CacheResult {
                    value: Some(value),
                    layer: CacheLayer::L1,
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                };
            }
        }
        let l2_value: Option<T> = self.l2.get(key).await;
        match l2_value {
            Some(value) => {
                if self.config.warm_l1_on_l2_hit {
                    if let Ok(raw) = serde_json::to_string(&value) {
                        self.l1.set(key, &raw, None);
                    }
                }
                CacheResult {
                    value: Some(value),
                    layer: CacheLayer::L2,
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                }
            }
            None => CacheResult {
                value: None,
                layer: CacheLayer::Miss,
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            },
        }
    }

    /// On miss, calls `compute` and stores into both layers. `compute` is
    /// not deduplicated across concurrent callers — only at-most-one-store
    /// per `(key, compute-result)` is guaranteed, per spec §4.3.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, compute: F, ttl_ms: Option<u64>) -> T
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let existing: CacheResult<T> = self.get(key).await;
        if let Some(value) = existing.value {
            return value;
        }
        let computed = compute().await;
        self.set(key, &computed, ttl_ms).await;
        computed
    }

    /// Writes L1 synchronously and L2 asynchronously (best-effort, logged
    /// on failure) — preserving the narrow window documented in spec §9
    /// where `L1.has(k) = true` but `L2.has(k) = false`.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_ms: Option<u64>) {
        if let Ok(raw) = serde_json::to_string(value) {
            self.l1.set(key, &raw, ttl_ms.map(Duration::from_millis));
        }
        let l2 = Arc::clone(&self.l2);
        let key = key.to_string();
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to snapshot value for async L2 write");
                return;
            }
        };
        tokio::spawn(async move {
            l2.set(&key, &value, ttl_ms).await;
        });
    }

    pub async fn delete(&self, key: &str) -> bool {
        let l1_removed = self.l1.delete(key);
        let l2_removed = self.l2.delete(key).await;
        l1_removed || l2_removed
    }

    /// Invalidates this replica's L1 synchronously, then broadcasts the
    /// pattern so every other replica (including, by convention, this one)
    /// invalidates on receipt.
    pub async fn invalidate_by_pattern(&self, pattern: &str, reason: Option<&str>) -> usize {
        let count = self.l1.invalidate_by_pattern(pattern);
        self.l2.invalidate_by_pattern(pattern, reason).await;
        count
    }

    pub fn l1_stats(&self) -> super::l1::L1Stats {
        self.l1.stats()
    }

    pub fn l2_stats(&self) -> super::l2::L2Stats {
        self.l2.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::InMemoryStore;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    struct Payload {
        v: i32,
    }

    fn cache() -> MultiLayerCache {
        MultiLayerCache::new(Arc::new(InMemoryStore::new()), MultiLayerConfig::default())
    }

    #[tokio::test]
    async fn set_then_get_hits_l1() {
        let cache = cache();
        cache.set("k", &Payload { v: 1 }, None).await;
        let result: CacheResult<Payload> = cache.get("k").await;
        assert_eq!(result.layer, CacheLayer::L1);
        assert_eq!(result.value, Some(Payload { v: 1 }));
    }

    #[tokio::test]
    async fn l2_hit_warms_l1() {
        let cache = cache();
        // populate L2 directly, bypassing L1, to exercise the warm path
        cache.l2.set("k", &Payload { v: 7 }, None).await;
        let result: CacheResult<Payload> = cache.get("k").await;
        assert_eq!(result.layer, CacheLayer::L2);
        let warmed = cache.l1.get("k");
        assert!(warmed.is_some());
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let cache = cache();
        let result: CacheResult<Payload> = cache.get("missing").await;
        assert_eq!(result.layer, CacheLayer::Miss);
    }

    #[tokio::test]
    async fn get_or_compute_stores_computed_value() {
        let cache = cache();
        let value = cache
            .get_or_compute("k", || async { Payload { v: 42 } }, None)
            .await;
        assert_eq!(value, Payload { v: 42 });
        let result: CacheResult<Payload> = cache.get("k").await;
        assert_eq!(result.value, Some(Payload { v: 42 }));
    }

    #[tokio::test]
    async fn invalidate_by_pattern_is_idempotent() {
        let cache = cache();
        cache.set("lb:guild:1", &Payload { v: 1 }, None).await;
        let first = cache.invalidate_by_pattern("lb:guild:", None).await;
        let second = cache.invalidate_by_pattern("lb:guild:", None).await;
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
