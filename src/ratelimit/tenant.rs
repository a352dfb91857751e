//! Tenant tier rate limiter (spec §4.6): per-`(tenantId, action)`
//! sliding-window admission over a sorted set. Grounded on
//! `caddy::enterprise::ratelimit::quota::QuotaManager`'s windowed-limit
//! shape, reimplemented against the sorted-set primitive the spec mandates.

use crate::config::{TenantActionLimit, TenantRateLimiterConfig};
use crate::error::Result;
use crate::substrate::SharedStore;
use rand::Rng;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct TenantCheckResult {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at_ms: u64,
    pub retry_after_ms: Option<u64>,
}

pub struct TenantRateLimiter {
    store: Arc<dyn SharedStore>,
}

impl TenantRateLimiter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Sorted set keyed `ratelimit:{tenantId}:{action}`, members formatted
    /// `timestamp:nonce` and scored by timestamp, symmetrically parsed on
    /// both insertion and the denial path (spec §9's flagged asymmetry is
    /// deliberately avoided here).
    pub async fn check(
        &self,
        tenant_id: &str,
        action: &str,
        config: &TenantRateLimiterConfig,
    ) -> Result<TenantCheckResult> {
        let limit_cfg = config
            .actions
            .get(action)
            .copied()
            .unwrap_or(TenantActionLimit { window_ms: 60_000, limit: -1 });

        if limit_cfg.limit < 0 {
            return Ok(TenantCheckResult {
                allowed: true,
                remaining: -1,
                limit: -1,
                reset_at_ms: 0,
                retry_after_ms: None,
            });
        }

        let key = format!("ratelimit:{tenant_id}:{action}");
        let now = now_ms();
        let window_start = now.saturating_sub(limit_cfg.window_ms) as f64;

        self.store.zremrangebyscore(&key, 0.0, window_start).await?;
        let current = self.store.zcard(&key).await?;

        if current >= limit_cfg.limit {
            let oldest = self.store.zrangebyscore(&key, 0.0, f64::MAX, Some(0), Some(1)).await?;
            let oldest_ts = oldest
                .first()
                .and_then(|m| parse_member(m))
                .unwrap_or(now);
            let reset_at_ms = oldest_ts + limit_cfg.window_ms;
            return Ok(TenantCheckResult {
                allowed: false,
                remaining: 0,
                limit: limit_cfg.limit,
                reset_at_ms,
                retry_after_ms: Some(reset_at_ms.saturating_sub(now)),
            });
        }

        let member = format!("{now}:{}", rand::thread_rng().gen::<u32>());
        self.store.zadd(&key, now as f64, &member).await?;
        let ttl_secs = limit_cfg.window_ms.div_ceil(1000) + 60;
        self.store.expire(&key, ttl_secs).await?;

        Ok(TenantCheckResult {
            allowed: true,
            remaining: limit_cfg.limit - current - 1,
            limit: limit_cfg.limit,
            reset_at_ms: now + limit_cfg.window_ms,
            retry_after_ms: None,
        })
    }
}

fn parse_member(member: &str) -> Option<u64> {
    member.split(':').next().and_then(|s| s.parse().ok())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::InMemoryStore;
    use std::collections::HashMap;

    fn config_with(action: &str, window_ms: u64, limit: i64) -> TenantRateLimiterConfig {
        let mut actions = HashMap::new();
        actions.insert(action.to_string(), TenantActionLimit { window_ms, limit });
        TenantRateLimiterConfig { actions }
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_denies() {
        let limiter = TenantRateLimiter::new(Arc::new(InMemoryStore::new()));
        let config = config_with("command", 60_000, 2);
        assert!(limiter.check("t1", "command", &config).await.unwrap().allowed);
        assert!(limiter.check("t1", "command", &config).await.unwrap().allowed);
        let third = limiter.check("t1", "command", &config).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.limit, 2);
        assert!(third.retry_after_ms.is_some());
    }

    #[tokio::test]
    async fn unlimited_action_always_admits() {
        let limiter = TenantRateLimiter::new(Arc::new(InMemoryStore::new()));
        let config = config_with("sync_request", 86_400_000, -1);
        for _ in 0..50 {
            assert!(limiter.check("t1", "sync_request", &config).await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn different_tenants_have_independent_windows() {
        let limiter = TenantRateLimiter::new(Arc::new(InMemoryStore::new()));
        let config = config_with("command", 60_000, 1);
        assert!(limiter.check("t1", "command", &config).await.unwrap().allowed);
        assert!(limiter.check("t2", "command", &config).await.unwrap().allowed);
    }
}
