//! The state substrate: a thin facade over the shared KV/pub-sub store.
//! Every other component reaches the shared store only through
//! [`SharedStore`] — it is the sole place that speaks to Redis directly.

mod memory;
mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use crate::error::Result;

/// A single invalidation or config-reload event delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct SubscriptionMessage {
    pub channel: String,
    pub payload: String,
}

/// The shared-KV contract (spec §6). All components consume this trait, never
/// `redis` directly — grounded on `caddy::database::cache::CacheManager`'s
/// facade shape and `stellar-insights-backend::rate_limit::RateLimiter`'s
/// real (non-simulated) client usage.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn incr(&self, key: &str) -> Result<i64>;
    async fn incrby(&self, key: &str, amount: i64) -> Result<i64>;
    async fn pexpire(&self, key: &str, ms: u64) -> Result<bool>;
    async fn expire(&self, key: &str, secs: u64) -> Result<bool>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<i64>;
    async fn zcard(&self, key: &str) -> Result<i64>;
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: Option<i64>,
        count: Option<i64>,
    ) -> Result<Vec<String>>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<i64>;

    async fn publish(&self, channel: &str, message: &str) -> Result<i64>;

    /// Subscribes to a channel on an independent connection, returning a
    /// broadcast receiver of messages published to it. The subscription
    /// stays live until every clone of the returned receiver is dropped and
    /// the underlying task observes the channel close.
    async fn subscribe(&self, channel: &str) -> Result<tokio::sync::broadcast::Receiver<SubscriptionMessage>>;

    /// Runs a set of named hash fields as a single `HSET`.
    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<Option<std::collections::HashMap<String, String>>>;

    /// Round-trip latency in milliseconds, or `None` if unreachable.
    async fn ping(&self) -> Option<f64>;
    fn is_connected(&self) -> bool;
}
