//! Cache invalidator (spec §4.9): translates domain write events into cache
//! operations with a recorded ring-buffer history. Grounded on
//! `caddy::enterprise::cache::invalidation`'s `TagInvalidator`/
//! `PatternInvalidator`/`PubSubInvalidator` shape; the bounded audit-log
//! ring buffer is this crate's own addition, since the teacher's
//! invalidators don't keep one themselves.

use super::keys;
use super::multilayer::MultiLayerCache;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Invalidate,
    WriteThrough,
    PatternInvalidate,
}

#[derive(Debug, Clone)]
pub struct InvalidationRecord {
    pub timestamp_ms: u64,
    pub pattern: String,
    pub strategy: Strategy,
    pub reason: String,
    pub affected_keys: Option<Vec<String>>,
}

/// Domain events that trigger cache invalidation, one variant per documented
/// event type in spec §4.9.
pub enum DomainEvent {
    UserVaultUpdate { user_id: String },
    ScoreUpdate { user_id: String, guild_id: String },
    LeaderboardChange { guild_id: String },
    TenantConfigChange { guild_id: String },
    ChainReorg,
    BalanceChange { wallet_addr: String },
    BulkUserUpdate { user_ids: Vec<String> },
    NamespaceInvalidation { namespace: String },
}

pub struct CacheInvalidator {
    cache: std::sync::Arc<MultiLayerCache>,
    history: Mutex<VecDeque<InvalidationRecord>>,
}

impl CacheInvalidator {
    pub fn new(cache: std::sync::Arc<MultiLayerCache>) -> Self {
        Self {
            cache,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub async fn handle(&self, event: DomainEvent) {
        match event {
            DomainEvent::UserVaultUpdate { user_id } => {
                let key = keys::user_vault(&user_id);
                self.cache.delete(&key).await;
                self.record(&key, Strategy::Invalidate, "user_vault_update", None);
            }
            DomainEvent::ScoreUpdate { user_id, guild_id } => {
                let position = keys::user_position(&user_id, &guild_id);
                let leaderboard = keys::guild_leaderboard(&guild_id);
                self.cache.delete(&position).await;
                self.cache.delete(&leaderboard).await;
                self.record(
                    &position,
                    Strategy::Invalidate,
                    "score_update",
                    Some(vec![position.clone(), leaderboard.clone()]),
                );
            }
            DomainEvent::LeaderboardChange { guild_id } => {
                let pattern = keys::guild_leaderboard(&guild_id);
                self.cache.invalidate_by_pattern(&pattern, Some("leaderboard_change")).await;
                self.record(&pattern, Strategy::PatternInvalidate, "leaderboard_change", None);
            }
            DomainEvent::TenantConfigChange { guild_id } => {
                let key = keys::tenant_config(&guild_id);
                self.cache.delete(&key).await;
                self.record(&key, Strategy::Invalidate, "tenant_config_change", None);
            }
            DomainEvent::ChainReorg => {
                let pattern = keys::invalidation_patterns::all_rpc();
                self.cache.invalidate_by_pattern(&pattern, Some("chain_reorg")).await;
                self.record(&pattern, Strategy::PatternInvalidate, "chain_reorg", None);
            }
            DomainEvent::BalanceChange { wallet_addr } => {
                let key = keys::rpc_balance(&wallet_addr);
                self.cache.delete(&key).await;
                self.record(&key, Strategy::Invalidate, "balance_change", None);
            }
            DomainEvent::BulkUserUpdate { user_ids } => {
                let keys_to_delete: Vec<String> = user_ids.iter().map(|u| keys::user_vault(u)).collect();
                let deletes = keys_to_delete.iter().map(|k| self.cache.delete(k));
                futures::future::join_all(deletes).await;
                self.record(
                    "bulk_user_update",
                    Strategy::Invalidate,
                    "bulk_user_update",
                    Some(keys_to_delete),
                );
            }
            DomainEvent::NamespaceInvalidation { namespace } => {
                let pattern = keys::invalidation_patterns::namespace(&namespace);
                self.cache.invalidate_by_pattern(&pattern, Some("namespace_invalidation")).await;
                self.record(&pattern, Strategy::PatternInvalidate, "namespace_invalidation", None);
            }
        }
    }

    /// Write-through variant: updates L1+L2 with a new value instead of
    /// deleting, for events that carry a replacement rather than a tombstone.
    pub async fn write_through<T: serde::Serialize>(&self, key: &str, value: &T, reason: &str) {
        self.cache.set(key, value, None).await;
        self.record(key, Strategy::WriteThrough, reason, None);
    }

    fn record(&self, pattern: &str, strategy: Strategy, reason: &str, affected_keys: Option<Vec<String>>) {
        let record = InvalidationRecord {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            pattern: pattern.to_string(),
            strategy,
            reason: reason.to_string(),
            affected_keys,
        };
        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub fn history(&self) -> Vec<InvalidationRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Counts per reason over the full retained history (bounded to
    /// `HISTORY_CAPACITY` most recent records).
    pub fn stats_by_reason(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for record in self.history.lock().iter() {
            *counts.entry(record.reason.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MultiLayerConfig;
    use crate::substrate::InMemoryStore;
    use std::sync::Arc;

    fn invalidator() -> CacheInvalidator {
        let cache = Arc::new(MultiLayerCache::new(Arc::new(InMemoryStore::new()), MultiLayerConfig::default()));
        CacheInvalidator::new(cache)
    }

    #[tokio::test]
    async fn user_vault_update_deletes_vault_key() {
        let inv = invalidator();
        inv.cache.set(&keys::user_vault("u1"), &serde_json::json!({"v": 1}), None).await;
        inv.handle(DomainEvent::UserVaultUpdate { user_id: "u1".to_string() }).await;
        let result: super::super::multilayer::CacheResult<serde_json::Value> =
            inv.cache.get(&keys::user_vault("u1")).await;
        assert!(result.value.is_none());
    }

    #[tokio::test]
    async fn history_is_bounded_to_capacity() {
        let inv = invalidator();
        for i in 0..(HISTORY_CAPACITY + 10) {
            inv.handle(DomainEvent::UserVaultUpdate { user_id: format!("u{i}") }).await;
        }
        assert_eq!(inv.history().len(), HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn stats_by_reason_counts_records() {
        let inv = invalidator();
        inv.handle(DomainEvent::ChainReorg).await;
        inv.handle(DomainEvent::ChainReorg).await;
        inv.handle(DomainEvent::UserVaultUpdate { user_id: "u1".to_string() }).await;
        let stats = inv.stats_by_reason();
        assert_eq!(stats.get("chain_reorg"), Some(&2));
        assert_eq!(stats.get("user_vault_update"), Some(&1));
    }
}
