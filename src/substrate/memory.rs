//! In-memory [`SharedStore`] fake used by unit tests, grounded on
//! `caddy::enterprise::cache::strategy::InMemoryStore` — no network, no
//! Redis required to exercise cache/rate-limit/budget logic.

use super::{SharedStore, SubscriptionMessage};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry>,
    sorted_sets: HashMap<String, Vec<(String, f64)>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// A fully in-process stand-in for the shared KV store. Sorted-set and
/// string operations behave identically to Redis for the subset this crate
/// uses; pub/sub is a local broadcast channel per channel name.
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<SubscriptionMessage>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<SubscriptionMessage> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.strings.get(key) {
            if entry.expires_at.is_some_and(|e| Instant::now() > e) {
                state.strings.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<()> {
        let mut state = self.state.lock();
        state.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(state.strings.remove(key).is_some() | state.sorted_sets.remove(key).is_some() | state.hashes.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.incrby(key, 1).await
    }

    async fn incrby(&self, key: &str, amount: i64) -> Result<i64> {
        let mut state = self.state.lock();
        let entry = state.strings.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry.value.parse().unwrap_or(0);
        let updated = current + amount;
        entry.value = updated.to_string();
        Ok(updated)
    }

    async fn pexpire(&self, key: &str, ms: u64) -> Result<bool> {
        let mut state = self.state.lock();
        if let Some(entry) = state.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_millis(ms));
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<bool> {
        self.pexpire(key, secs * 1000).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<i64> {
        let mut state = self.state.lock();
        let set = state.sorted_sets.entry(key.to_string()).or_default();
        if let Some(existing) = set.iter_mut().find(|(m, _)| m == member) {
            existing.1 = score;
            Ok(0)
        } else {
            set.push((member.to_string(), score));
            Ok(1)
        }
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        let state = self.state.lock();
        Ok(state.sorted_sets.get(key).map_or(0, |s| s.len() as i64))
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: Option<i64>,
        count: Option<i64>,
    ) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut members: Vec<(String, f64)> = state
            .sorted_sets
            .get(key)
            .map(|s| s.iter().filter(|(_, sc)| *sc >= min && *sc <= max).cloned().collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let mut iter = members.into_iter().map(|(m, _)| m);
        if let Some(o) = offset {
            iter = iter.skip(o.max(0) as usize).collect::<Vec<_>>().into_iter();
        }
        let result: Vec<String> = match count {
            Some(c) => iter.take(c.max(0) as usize).collect(),
            None => iter.collect(),
        };
        Ok(result)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<i64> {
        let mut state = self.state.lock();
        if let Some(set) = state.sorted_sets.get_mut(key) {
            let before = set.len();
            set.retain(|(_, sc)| !(*sc >= min && *sc <= max));
            Ok((before - set.len()) as i64)
        } else {
            Ok(0)
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<i64> {
        let sender = self.sender_for(channel);
        let receivers = sender.receiver_count();
        let _ = sender.send(SubscriptionMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        });
        Ok(receivers as i64)
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<SubscriptionMessage>> {
        Ok(self.sender_for(channel).subscribe())
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut state = self.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let state = self.state.lock();
        Ok(state.hashes.get(key).cloned())
    }

    async fn ping(&self) -> Option<f64> {
        Some(0.0)
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_roundtrip() {
        let store = InMemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entries_return_absent() {
        let store = InMemoryStore::new();
        store.set("k", "v", Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zset_orders_by_score_and_evicts_range() {
        let store = InMemoryStore::new();
        store.zadd("z", 1.0, "a").await.unwrap();
        store.zadd("z", 2.0, "b").await.unwrap();
        store.zadd("z", 3.0, "c").await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 3);
        let removed = store.zremrangebyscore("z", 0.0, 1.5).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.zcard("z").await.unwrap(), 2);
        let members = store.zrangebyscore("z", 0.0, 10.0, None, None).await.unwrap();
        assert_eq!(members, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn incrby_accumulates() {
        let store = InMemoryStore::new();
        assert_eq!(store.incrby("n", 5).await.unwrap(), 5);
        assert_eq!(store.incrby("n", 3).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn publish_subscribe_delivers_message() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe("chan").await.unwrap();
        store.publish("chan", "hello").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, "hello");
    }
}
