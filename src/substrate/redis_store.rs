//! Real Redis-backed [`SharedStore`], grounded on
//! `caddy::database::cache::CacheManager`'s `redis::aio::ConnectionManager`
//! usage and `stellar-insights-backend::rate_limit::RateLimiter`'s
//! `redis::Client::open` / `AsyncCommands` pattern.

use super::{SharedStore, SubscriptionMessage};
use crate::error::{GatekeeperError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

pub struct RedisStore {
    manager: ConnectionManager,
    client: redis::Client,
    connected: Arc<AtomicBool>,
}

impl RedisStore {
    /// Connects using `ConnectionManager`, which reconnects transparently
    /// under the hood — matching `CacheManager::new`'s connection strategy.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        tracing::info!(redis_url, "connected to shared KV store");
        Ok(Self {
            manager,
            client,
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        match conn.get::<_, Option<String>>(key).await {
            Ok(v) => Ok(v),
            Err(e) => {
                tracing::warn!(key, error = %e, "shared KV get failed");
                Err(GatekeeperError::Redis(e))
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<()> {
        let mut conn = self.conn();
        let result = if let Some(ttl_ms) = ttl_ms {
            conn.pset_ex::<_, _, ()>(key, value, ttl_ms).await
        } else {
            conn.set::<_, _, ()>(key, value).await
        };
        result.map_err(|e| {
            tracing::warn!(key, error = %e, "shared KV set failed");
            GatekeeperError::Redis(e)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        match conn.del::<_, i64>(key).await {
            Ok(n) => Ok(n > 0),
            Err(e) => {
                tracing::warn!(key, error = %e, "shared KV delete failed");
                Ok(false)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.incr(key, 1).await?)
    }

    async fn incrby(&self, key: &str, amount: i64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.incr(key, amount).await?)
    }

    async fn pexpire(&self, key: &str, ms: u64) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.pexpire::<_, bool>(key, ms as i64).await?)
    }

    async fn expire(&self, key: &str, secs: u64) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.expire::<_, bool>(key, secs as i64).await?)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.zadd(key, member, score).await?)
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.zcard(key).await?)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: Option<i64>,
        count: Option<i64>,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = match (offset, count) {
            (Some(o), Some(c)) => {
                redis::cmd("ZRANGEBYSCORE")
                    .arg(key)
                    .arg(min)
                    .arg(max)
                    .arg("LIMIT")
                    .arg(o)
                    .arg(c)
                    .query_async(&mut conn)
                    .await?
            }
            _ => conn.zrangebyscore(key, min, max).await?,
        };
        Ok(members)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.zrembyscore(key, min, max).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<i64> {
        let mut conn = self.conn();
        Ok(conn.publish(channel, message).await?)
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<SubscriptionMessage>> {
        let (tx, rx) = broadcast::channel(256);
        let client = self.client.clone();
        let channel_owned = channel.to_string();
        tokio::spawn(async move {
            loop {
                let conn = match client.get_async_pubsub().await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(error = %e, "pub/sub connection failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let mut pubsub = conn;
                if let Err(e) = pubsub.subscribe(&channel_owned).await {
                    tracing::warn!(error = %e, "pub/sub subscribe failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
                let mut stream = pubsub.on_message();
                use futures::StreamExt;
                loop {
                    match stream.next().await {
                        Some(msg) => {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(_) => continue,
                            };
                            let out = SubscriptionMessage {
                                channel: channel_owned.clone(),
                                payload,
                            };
                            if tx.send(out).is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.conn();
        let owned: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &owned).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn ping(&self) -> Option<f64> {
        let start = Instant::now();
        let mut conn = self.conn();
        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(_) => {
                self.connected.store(true, Ordering::Relaxed);
                Some(start.elapsed().as_secs_f64() * 1000.0)
            }
            Err(e) => {
                tracing::warn!(error = %e, "ping failed");
                self.connected.store(false, Ordering::Relaxed);
                None
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
