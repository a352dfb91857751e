//! L2 shared-KV cache (spec §4.2): JSON-serialized entries, TTL ceiling,
//! pattern invalidation broadcast through pub/sub instead of a scan.
//! Grounded on `caddy::database::cache::CacheManager`'s Redis tier.

use crate::config::L2Config;
use crate::substrate::SharedStore;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

pub const INVALIDATION_CHANNEL: &str = "gatekeeper:cache:invalidation";

#[derive(Debug, Default, Clone, Copy)]
pub struct L2Stats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

pub struct L2Cache {
    store: Arc<dyn SharedStore>,
    config: L2Config,
    namespace: String,
    stats: parking_lot::Mutex<L2Stats>,
}

impl L2Cache {
    pub fn new(store: Arc<dyn SharedStore>, config: L2Config, namespace: impl Into<String>) -> Self {
        Self {
            store,
            config,
            namespace: namespace.into(),
            stats: parking_lot::Mutex::new(L2Stats::default()),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Any KV/network error on read counts as a miss and logs — the design
    /// fails open for reads so L2 unavailability degrades to recomputation.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = self.namespaced(key);
        match self.store.get(&full_key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.record(|s| s.hits += 1);
                    Some(value)
                }
                Err(e) => {
                    tracing::warn!(key = %full_key, error = %e, "L2 deserialize failed");
                    self.record(|s| {
                        s.misses += 1;
                        s.errors += 1;
                    });
                    None
                }
            },
            Ok(None) => {
                self.record(|s| s.misses += 1);
                None
            }
            Err(e) => {
                tracing::warn!(key = %full_key, error = %e, "L2 get failed, treating as miss");
                self.record(|s| {
                    s.misses += 1;
                    s.errors += 1;
                });
                None
            }
        }
    }

    /// On a write error, logs and returns without surfacing to the caller.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_ms: Option<u64>) {
        let full_key = self.namespaced(key);
        let ttl_ms = ttl_ms.unwrap_or(self.config.default_ttl_ms).min(self.config.default_ttl_ms.max(1));
        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(key = %full_key, error = %e, "L2 serialize failed");
                return;
            }
        };
        if let Err(e) = self.store.set(&full_key, &serialized, Some(ttl_ms)).await {
            tracing::warn!(key = %full_key, error = %e, "L2 set failed");
            self.record(|s| s.errors += 1);
            return;
        }
        self.record(|s| s.sets += 1);
    }

    /// On error, logs and returns `false` rather than propagating.
    pub async fn delete(&self, key: &str) -> bool {
        let full_key = self.namespaced(key);
        match self.store.delete(&full_key).await {
            Ok(removed) => {
                if removed {
                    self.record(|s| s.deletes += 1);
                }
                removed
            }
            Err(e) => {
                tracing::warn!(key = %full_key, error = %e, "L2 delete failed");
                self.record(|s| s.errors += 1);
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.store.exists(&self.namespaced(key)).await.unwrap_or(false)
    }

    /// Does not scan or delete L2 entries directly; it broadcasts the
    /// pattern to all replicas and relies on TTL for L2-side expiry, per
    /// spec §4.2/§9.
    pub async fn invalidate_by_pattern(&self, pattern: &str, reason: Option<&str>) {
        let payload = serde_json::json!({
            "pattern": pattern,
            "originNode": crate::config::source_label(),
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            "reason": reason,
        });
        if let Ok(msg) = serde_json::to_string(&payload) {
            if let Err(e) = self.store.publish(INVALIDATION_CHANNEL, &msg).await {
                tracing::warn!(pattern, error = %e, "L2 invalidation broadcast failed");
            }
        }
    }

    pub fn stats(&self) -> L2Stats {
        *self.stats.lock()
    }

    fn record(&self, f: impl FnOnce(&mut L2Stats)) {
        if self.config.enable_stats {
            f(&mut self.stats.lock());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::InMemoryStore;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        v: i32,
    }

    fn cache() -> L2Cache {
        L2Cache::new(Arc::new(InMemoryStore::new()), L2Config::default(), "ns")
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_json() {
        let cache = cache();
        cache.set("k", &Payload { v: 1 }, None).await;
        let got: Option<Payload> = cache.get("k").await;
        assert_eq!(got, Some(Payload { v: 1 }));
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let cache = cache();
        let got: Option<Payload> = cache.get("missing").await;
        assert_eq!(got, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = cache();
        cache.set("k", &Payload { v: 1 }, None).await;
        assert!(cache.delete("k").await);
        let got: Option<Payload> = cache.get("k").await;
        assert_eq!(got, None);
    }
}
