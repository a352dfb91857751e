//! Configuration surface (spec §6). Plain, serde-deserializable structs
//! constructed by the embedding application and passed into constructors —
//! no configuration-loading framework lives in this crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1Config {
    pub max_entries: usize,
    pub default_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
    pub enable_stats: bool,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_ms: 60_000,
            cleanup_interval_ms: 30_000,
            enable_stats: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2Config {
    pub default_ttl_ms: u64,
    pub enable_stats: bool,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            enable_stats: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiLayerConfig {
    pub l1: L1Config,
    pub l2: L2Config,
    pub warm_l1_on_l2_hit: bool,
    pub namespace: String,
}

impl Default for MultiLayerConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            l2: L2Config::default(),
            warm_l1_on_l2_hit: true,
            namespace: "gatekeeper".to_string(),
        }
    }
}

/// Admission class derived from a tenant's reputation/score tier (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionClass {
    Free,
    Pro,
    Enterprise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLimitParams {
    pub guild_limit: u32,
    pub guild_duration_ms: u64,
    pub user_limit: u32,
    pub user_duration_ms: u64,
    pub channel_limit: u32,
    pub channel_duration_ms: u64,
    pub burst_capacity: u32,
    pub burst_refill_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRateLimiterConfig {
    pub by_class: HashMap<String, RequestLimitParams>,
}

impl Default for RequestRateLimiterConfig {
    fn default() -> Self {
        let mut by_class = HashMap::new();
        by_class.insert(
            "free".to_string(),
            RequestLimitParams {
                guild_limit: 60,
                guild_duration_ms: 60_000,
                user_limit: 10,
                user_duration_ms: 60_000,
                channel_limit: 20,
                channel_duration_ms: 60_000,
                burst_capacity: 3,
                burst_refill_per_sec: 0.5,
            },
        );
        by_class.insert(
            "pro".to_string(),
            RequestLimitParams {
                guild_limit: 300,
                guild_duration_ms: 60_000,
                user_limit: 40,
                user_duration_ms: 60_000,
                channel_limit: 100,
                channel_duration_ms: 60_000,
                burst_capacity: 6,
                burst_refill_per_sec: 1.0,
            },
        );
        by_class.insert(
            "enterprise".to_string(),
            RequestLimitParams {
                guild_limit: 1_000,
                guild_duration_ms: 60_000,
                user_limit: 100,
                user_duration_ms: 60_000,
                channel_limit: 400,
                channel_duration_ms: 60_000,
                burst_capacity: 10,
                burst_refill_per_sec: 2.0,
            },
        );
        Self { by_class }
    }
}

/// Per-action window + limit for the tenant tier rate limiter (spec §4.6).
/// `limit == -1` means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TenantActionLimit {
    pub window_ms: u64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRateLimiterConfig {
    pub actions: HashMap<String, TenantActionLimit>,
}

impl Default for TenantRateLimiterConfig {
    fn default() -> Self {
        let mut actions = HashMap::new();
        actions.insert(
            "command".to_string(),
            TenantActionLimit {
                window_ms: 60_000,
                limit: 30,
            },
        );
        actions.insert(
            "eligibility_check".to_string(),
            TenantActionLimit {
                window_ms: 3_600_000,
                limit: 20,
            },
        );
        actions.insert(
            "sync_request".to_string(),
            TenantActionLimit {
                window_ms: 86_400_000,
                limit: 10,
            },
        );
        Self { actions }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBehindConfig {
    pub sync_interval_ms: u64,
    pub batch_size: usize,
    pub max_pending_items: usize,
    pub max_retries: u32,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5_000,
            batch_size: 100,
            max_pending_items: 10_000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub reservation_ttl_ms: u64,
    pub reap_interval_ms: u64,
    pub drift_tolerance: f64,
    pub circuit_breaker_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_ms: 120_000,
            reap_interval_ms: 30_000,
            drift_tolerance: 0.01,
            circuit_breaker_threshold: 0.05,
        }
    }
}

/// Reads `POD_NAME`/`HOSTNAME` for source labeling in events (spec §6); the
/// only environment the core reads outside of `NODE_ENV`.
pub fn source_label() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
