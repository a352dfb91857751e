//! Multi-dimensional request rate limiter (spec §4.4): admits or rejects a
//! request across four dimensions, in order: user, guild/community,
//! channel, burst. Grounded on
//! `stellar-insights-backend::rate_limit::RateLimiter`'s real Redis
//! INCR/EXPIRE counter-with-TTL pattern, composed with a token-bucket
//! primitive for the burst dimension in the style of
//! `caddy::enterprise::ratelimit::algorithm::TokenBucket`.

use crate::config::{AdmissionClass, RequestLimitParams, RequestRateLimiterConfig};
use crate::substrate::SharedStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    User,
    Guild,
    Channel,
    Burst,
}

#[derive(Debug, Clone)]
pub struct RequestCheckContext {
    pub community_id: Option<String>,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    pub access_class: AdmissionClass,
}

#[derive(Debug, Clone)]
pub struct RequestCheckResult {
    pub allowed: bool,
    pub dimension: Option<Dimension>,
    pub remaining: i64,
    pub retry_after_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenBucketState {
    tokens: f64,
    last_refill_ms: u64,
}

pub struct RequestRateLimiter {
    store: Arc<dyn SharedStore>,
    config: RequestRateLimiterConfig,
}

impl RequestRateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, config: RequestRateLimiterConfig) -> Self {
        Self { store, config }
    }

    fn params_for(&self, class: AdmissionClass) -> RequestLimitParams {
        let key = match class {
            AdmissionClass::Free => "free",
            AdmissionClass::Pro => "pro",
            AdmissionClass::Enterprise => "enterprise",
        };
        self.config
            .by_class
            .get(key)
            .cloned()
            .unwrap_or(RequestLimitParams {
                guild_limit: 60,
                guild_duration_ms: 60_000,
                user_limit: 10,
                user_duration_ms: 60_000,
                channel_limit: 20,
                channel_duration_ms: 60_000,
                burst_capacity: 3,
                burst_refill_per_sec: 0.5,
            })
    }

    /// Checks dimensions in the order the source consumes them — guild,
    /// then user, then channel, then burst — so that a user-limit failure
    /// arriving after a guild point was already consumed can be refunded
    /// (spec §4.4's worked "burst refund" scenario). Denials are still
    /// reported against the dimension that actually failed. On KV failure
    /// at any dimension, fails closed — an explicit deviation from the
    /// cache's fail-open-on-read policy, required so admission never
    /// degrades under substrate outage.
    pub async fn check(&self, ctx: &RequestCheckContext) -> RequestCheckResult {
        let params = self.params_for(ctx.access_class);

        let mut guild_consumed = false;

        if let Some(guild_id) = &ctx.community_id {
            match self
                .consume_counter(&format!("ratelimit:guild:{guild_id}"), params.guild_limit, params.guild_duration_ms)
                .await
            {
                Ok(Some(remaining)) if remaining < 0 => {
                    return RequestCheckResult {
                        allowed: false,
                        dimension: Some(Dimension::Guild),
                        remaining: 0,
                        retry_after_ms: params.guild_duration_ms,
                    };
                }
                Ok(_) => guild_consumed = true,
                Err(_) => return fail_closed(Dimension::Guild, params.guild_duration_ms),
            }
        }

        if let Some(user_id) = &ctx.user_id {
            match self
                .consume_counter(&format!("ratelimit:user:{user_id}"), params.user_limit, params.user_duration_ms)
                .await
            {
                Ok(Some(remaining)) if remaining < 0 => {
                    if guild_consumed {
                        if let Some(guild_id) = &ctx.community_id {
                            self.refund_counter(&format!("ratelimit:guild:{guild_id}")).await;
                        }
                    }
                    return RequestCheckResult {
                        allowed: false,
                        dimension: Some(Dimension::User),
                        remaining: 0,
                        retry_after_ms: params.user_duration_ms,
                    };
                }
                Ok(_) => {}
                Err(_) => {
                    if guild_consumed {
                        if let Some(guild_id) = &ctx.community_id {
                            self.refund_counter(&format!("ratelimit:guild:{guild_id}")).await;
                        }
                    }
                    return fail_closed(Dimension::User, params.user_duration_ms);
                }
            }
        }

        if let Some(channel_id) = &ctx.channel_id {
            match self
                .consume_counter(&format!("ratelimit:channel:{channel_id}"), params.channel_limit, params.channel_duration_ms)
                .await
            {
                Ok(Some(remaining)) if remaining < 0 => {
                    if guild_consumed {
                        if let Some(guild_id) = &ctx.community_id {
                            self.refund_counter(&format!("ratelimit:guild:{guild_id}")).await;
                        }
                    }
                    return RequestCheckResult {
                        allowed: false,
                        dimension: Some(Dimension::Channel),
                        remaining: 0,
                        retry_after_ms: params.channel_duration_ms,
                    };
                }
                Ok(_) => {}
                Err(_) => return fail_closed(Dimension::Channel, params.channel_duration_ms),
            }
        }

        let burst_scope = ctx.user_id.clone().unwrap_or_else(|| "anonymous".to_string());
        match self
            .consume_token_bucket(&format!("ratelimit:burst:{burst_scope}"), params.burst_capacity as f64, params.burst_refill_per_sec)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                if guild_consumed {
                    if let Some(guild_id) = &ctx.community_id {
                        self.refund_counter(&format!("ratelimit:guild:{guild_id}")).await;
                    }
                }
                return RequestCheckResult {
                    allowed: false,
                    dimension: Some(Dimension::Burst),
                    remaining: 0,
                    retry_after_ms: (1000.0 / params.burst_refill_per_sec.max(0.001)) as u64,
                };
            }
            Err(_) => return fail_closed(Dimension::Burst, 1000),
        }

        RequestCheckResult {
            allowed: true,
            dimension: None,
            remaining: -1,
            retry_after_ms: 0,
        }
    }

    /// Increments the counter and compares to `limit`; equivalent to a
    /// decrement-with-fail counter seeded at `limit`. Returns the remaining
    /// budget after this consume (negative once over limit).
    async fn consume_counter(&self, key: &str, limit: u32, duration_ms: u64) -> crate::error::Result<Option<i64>> {
        let count = self.store.incr(key).await?;
        if count == 1 {
            self.store.pexpire(key, duration_ms).await?;
        }
        Ok(Some(limit as i64 - count))
    }

    async fn refund_counter(&self, key: &str) {
        if let Err(e) = self.store.incrby(key, -1).await {
            tracing::warn!(key, error = %e, "best-effort rate-limit refund failed");
        }
    }

    async fn consume_token_bucket(&self, key: &str, capacity: f64, refill_per_sec: f64) -> crate::error::Result<bool> {
        let now = now_ms();
        let state = match self.store.get(key).await? {
            Some(raw) => serde_json::from_str::<TokenBucketState>(&raw).unwrap_or(TokenBucketState {
                tokens: capacity,
                last_refill_ms: now,
            }),
            None => TokenBucketState {
                tokens: capacity,
                last_refill_ms: now,
            },
        };
        let elapsed_secs = now.saturating_sub(state.last_refill_ms) as f64 / 1000.0;
        let refilled = (state.tokens + elapsed_secs * refill_per_sec).min(capacity);
        if refilled < 1.0 {
            let persisted = TokenBucketState {
                tokens: refilled,
                last_refill_ms: now,
            };
            let serialized = serde_json::to_string(&persisted)?;
            self.store.set(key, &serialized, Some(60_000)).await?;
            return Ok(false);
        }
        let persisted = TokenBucketState {
            tokens: refilled - 1.0,
            last_refill_ms: now,
        };
        let serialized = serde_json::to_string(&persisted)?;
        self.store.set(key, &serialized, Some(60_000)).await?;
        Ok(true)
    }
}

fn fail_closed(dimension: Dimension, retry_after_ms: u64) -> RequestCheckResult {
    RequestCheckResult {
        allowed: false,
        dimension: Some(dimension),
        remaining: 0,
        retry_after_ms,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
