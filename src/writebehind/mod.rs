//! Write-behind score cache (spec §4.8): absorbs high-frequency score
//! mutations, writes them synchronously to a low-latency authoritative
//! store, and replicates batches to the relational store of record with
//! retry-with-cap and graceful shutdown flush. Grounded on
//! `caddy::enterprise::cache::strategy::WriteBehindCache`'s timer-driven
//! batched flush over a pending set.

use crate::config::WriteBehindConfig;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Authoritative, low-latency store the synchronous half of `updateScore`
/// writes to. Kept as a trait so tests can substitute an in-memory store.
#[async_trait]
pub trait AuthoritativeScoreStore: Send + Sync {
    async fn write(&self, update: &ScoreUpdate) -> Result<Score>;
}

/// The batch-sync contract (spec §9 polymorphism note): `sync(items) ->
/// {success, failed}`, injected as `postgresSyncFn`.
#[async_trait]
pub trait BatchSync: Send + Sync {
    async fn sync(&self, items: &[PendingSyncItem]) -> SyncBatchResult;
}

#[derive(Debug, Clone)]
pub struct ScoreUpdate {
    pub tenant_id: String,
    pub profile_id: String,
    pub conviction_delta: f64,
    pub activity_delta: f64,
}

#[derive(Debug, Clone)]
pub struct Score {
    pub conviction_score: String,
    pub activity_score: String,
    pub rank: i64,
}

/// In-memory queue item. Score fields stay string-carrying snapshots — the
/// authoritative store's native return type — and are only parsed at the
/// relational sync boundary, per spec §9's flagged design note.
#[derive(Debug, Clone)]
pub struct PendingSyncItem {
    pub tenant_id: String,
    pub profile_id: String,
    pub conviction_score: String,
    pub activity_score: String,
    pub rank: i64,
    pub updated_at_ms: u64,
    pub retry_count: u32,
    pub enqueued_at_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SyncBatchResult {
    pub success: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteBehindStatus {
    pub pending_count: usize,
    pub running: bool,
    pub total_synced: u64,
    pub total_dropped: u64,
}

fn coalescing_key(tenant_id: &str, profile_id: &str) -> String {
    format!("{tenant_id}:{profile_id}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct WriteBehindCache {
    authoritative: Arc<dyn AuthoritativeScoreStore>,
    sync_fn: Arc<dyn BatchSync>,
    config: WriteBehindConfig,
    pending: DashMap<String, PendingSyncItem>,
    order: Mutex<VecDeque<String>>,
    running: AtomicBool,
    total_synced: std::sync::atomic::AtomicU64,
    total_dropped: std::sync::atomic::AtomicU64,
}

impl WriteBehindCache {
    pub fn new(authoritative: Arc<dyn AuthoritativeScoreStore>, sync_fn: Arc<dyn BatchSync>, config: WriteBehindConfig) -> Self {
        Self {
            authoritative,
            sync_fn,
            config,
            pending: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            total_synced: std::sync::atomic::AtomicU64::new(0),
            total_dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Writes synchronously to the authoritative store first — the caller
    /// is never told an update succeeded that the authoritative store did
    /// not accept — then enqueues the coalesced snapshot.
    pub async fn update_score(&self, update: ScoreUpdate) -> Result<Score> {
        if self.pending.len() >= self.config.max_pending_items {
            self.process_sync_queue().await;
        }

        let result = self.authoritative.write(&update).await?;
        self.enqueue(&update.tenant_id, &update.profile_id, &result);
        Ok(result)
    }

    pub async fn batch_update_scores(&self, updates: Vec<ScoreUpdate>) -> (Vec<Score>, Vec<String>) {
        let mut success = Vec::new();
        let mut failed = Vec::new();
        for update in updates {
            let key = coalescing_key(&update.tenant_id, &update.profile_id);
            match self.update_score(update).await {
                Ok(score) => success.push(score),
                Err(_) => failed.push(key),
            }
        }
        (success, failed)
    }

    /// An incoming update for an existing coalescing key replaces the
    /// prior value; the queue grows only in unique-key count.
    fn enqueue(&self, tenant_id: &str, profile_id: &str, result: &Score) {
        let key = coalescing_key(tenant_id, profile_id);
        let is_new = !self.pending.contains_key(&key);
        self.pending.insert(
            key.clone(),
            PendingSyncItem {
                tenant_id: tenant_id.to_string(),
                profile_id: profile_id.to_string(),
                conviction_score: result.conviction_score.clone(),
                activity_score: result.activity_score.clone(),
                rank: result.rank,
                updated_at_ms: now_ms(),
                retry_count: 0,
                enqueued_at_ms: now_ms(),
            },
        );
        if is_new {
            if let Ok(mut order) = self.order.try_lock() {
                order.push_back(key);
            }
        }
    }

    /// Drains up to `batch_size` items via the injected sync function.
    /// Failures are re-enqueued with `retry_count + 1`; items exceeding
    /// `max_retries` are dropped with a metric.
    pub async fn process_sync_queue(&self) -> SyncBatchResult {
        let mut order = self.order.lock().await;
        let mut batch = Vec::new();
        let mut drained_keys = Vec::new();
        while batch.len() < self.config.batch_size {
            let Some(key) = order.pop_front() else { break };
            if let Some((_, item)) = self.pending.remove(&key) {
                batch.push(item);
                drained_keys.push(key);
            }
        }
        drop(order);

        if batch.is_empty() {
            return SyncBatchResult::default();
        }

        let result = self.sync_fn.sync(&batch).await;
        self.total_synced.fetch_add(result.success.len() as u64, Ordering::Relaxed);

        for (tenant_id, profile_id) in &result.failed {
            let key = coalescing_key(tenant_id, profile_id);
            if let Some(mut item) = batch
                .iter()
                .find(|i| i.tenant_id == *tenant_id && i.profile_id == *profile_id)
                .cloned()
            {
                item.retry_count += 1;
                if item.retry_count > self.config.max_retries {
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(tenant_id, profile_id, "write-behind item dropped after exhausting retries");
                    continue;
                }
                // only re-enqueue if nothing newer has superseded it
                if !self.pending.contains_key(&key) {
                    self.pending.insert(key.clone(), item);
                    self.order.lock().await.push_back(key);
                }
            }
        }

        result
    }

    /// Drains all pending items with repeated batched syncs, bounded by a
    /// hard deadline for graceful shutdown.
    pub async fn flush_sync(&self, deadline: std::time::Duration) -> SyncBatchResult {
        let start = std::time::Instant::now();
        let mut combined = SyncBatchResult::default();
        while !self.pending.is_empty() && start.elapsed() < deadline {
            let batch_result = self.process_sync_queue().await;
            combined.success.extend(batch_result.success);
            combined.failed.extend(batch_result.failed);
            if combined.success.is_empty() && combined.failed.is_empty() {
                break;
            }
        }
        combined
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::Relaxed);
        let cache = Arc::clone(self);
        let interval_ms = self.config.sync_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                if !cache.running.load(Ordering::Relaxed) {
                    break;
                }
                cache.process_sync_queue().await;
            }
        })
    }

    /// Disarms the timer and drains with a bounded deadline.
    pub async fn stop(&self, deadline: std::time::Duration) -> SyncBatchResult {
        self.running.store(false, Ordering::Relaxed);
        self.flush_sync(deadline).await
    }

    pub fn get_status(&self) -> WriteBehindStatus {
        WriteBehindStatus {
            pending_count: self.pending.len(),
            running: self.running.load(Ordering::Relaxed),
            total_synced: self.total_synced.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn get_pending_for_community(&self, tenant_id: &str) -> Vec<PendingSyncItem> {
        self.pending
            .iter()
            .filter(|entry| entry.value().tenant_id == tenant_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeAuthoritativeStore {
        scores: StdMutex<std::collections::HashMap<String, (f64, f64)>>,
    }

    impl FakeAuthoritativeStore {
        fn new() -> Self {
            Self { scores: StdMutex::new(std::collections::HashMap::new()) }
        }
    }

    #[async_trait]
    impl AuthoritativeScoreStore for FakeAuthoritativeStore {
        async fn write(&self, update: &ScoreUpdate) -> Result<Score> {
            let mut scores = self.scores.lock().unwrap();
            let key = coalescing_key(&update.tenant_id, &update.profile_id);
            let entry = scores.entry(key).or_insert((0.0, 0.0));
            entry.0 += update.conviction_delta;
            entry.1 += update.activity_delta;
            Ok(Score {
                conviction_score: entry.0.to_string(),
                activity_score: entry.1.to_string(),
                rank: 1,
            })
        }
    }

    struct AlwaysSucceedsSync;

    #[async_trait]
    impl BatchSync for AlwaysSucceedsSync {
        async fn sync(&self, items: &[PendingSyncItem]) -> SyncBatchResult {
            SyncBatchResult {
                success: items.iter().map(|i| (i.tenant_id.clone(), i.profile_id.clone())).collect(),
                failed: vec![],
            }
        }
    }

    struct AlwaysFailsSync;

    #[async_trait]
    impl BatchSync for AlwaysFailsSync {
        async fn sync(&self, items: &[PendingSyncItem]) -> SyncBatchResult {
            SyncBatchResult {
                success: vec![],
                failed: items.iter().map(|i| (i.tenant_id.clone(), i.profile_id.clone())).collect(),
            }
        }
    }

    fn cache_with(sync_fn: Arc<dyn BatchSync>) -> WriteBehindCache {
        WriteBehindCache::new(Arc::new(FakeAuthoritativeStore::new()), sync_fn, WriteBehindConfig::default())
    }

    #[tokio::test]
    async fn coalesces_repeated_updates_into_one_pending_item() {
        let cache = cache_with(Arc::new(AlwaysSucceedsSync));
        for delta in [100.0, 200.0, 300.0] {
            cache
                .update_score(ScoreUpdate {
                    tenant_id: "t1".to_string(),
                    profile_id: "p1".to_string(),
                    conviction_delta: delta,
                    activity_delta: 0.0,
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.get_status().pending_count, 1);
        let pending = cache.get_pending_for_community("t1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].conviction_score, "600");
    }

    #[tokio::test]
    async fn flush_sync_drains_all_pending_items() {
        let cache = cache_with(Arc::new(AlwaysSucceedsSync));
        cache
            .update_score(ScoreUpdate {
                tenant_id: "t1".to_string(),
                profile_id: "p1".to_string(),
                conviction_delta: 1.0,
                activity_delta: 0.0,
            })
            .await
            .unwrap();
        let result = cache.flush_sync(std::time::Duration::from_secs(1)).await;
        assert_eq!(result.success.len(), 1);
        assert_eq!(cache.get_status().pending_count, 0);
    }

    #[tokio::test]
    async fn items_exceeding_max_retries_are_dropped() {
        let mut config = WriteBehindConfig::default();
        config.max_retries = 1;
        let cache = WriteBehindCache::new(Arc::new(FakeAuthoritativeStore::new()), Arc::new(AlwaysFailsSync), config);
        cache
            .update_score(ScoreUpdate {
                tenant_id: "t1".to_string(),
                profile_id: "p1".to_string(),
                conviction_delta: 1.0,
                activity_delta: 0.0,
            })
            .await
            .unwrap();
        cache.process_sync_queue().await;
        cache.process_sync_queue().await;
        assert_eq!(cache.get_status().total_dropped, 1);
        assert_eq!(cache.get_status().pending_count, 0);
    }
}
