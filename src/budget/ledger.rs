//! The relational-store contract (spec §6), consumed by both the budget
//! manager and the write-behind cache. Written directly against
//! `sqlx::PgPool`, the way `caddy::saas::billing::BillingManager` takes a
//! `PgPool` — a further trait layer would be pure indirection over an
//! already-concrete contract.

use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LotForDebit {
    pub lot_id: String,
    pub remaining_micro: i64,
}

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| {
            crate::error::GatekeeperError::PermanentStoreError(format!("migration failed: {e}"))
        })?;
        Ok(())
    }

    /// True iff `new_token` is strictly greater than the persisted fence for
    /// `tenant_id`; stale tokens are rejected rather than applied.
    pub async fn advance_fence(&self, tenant_id: &str, new_token: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tenant_fence (tenant_id, fence_token)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO UPDATE
              SET fence_token = EXCLUDED.fence_token
              WHERE tenant_fence.fence_token < EXCLUDED.fence_token
            "#,
        )
        .bind(tenant_id)
        .bind(new_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn stored_fence(&self, tenant_id: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT fence_token FROM tenant_fence WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0).unwrap_or(0))
    }

    /// `ON CONFLICT (idem_key) DO NOTHING` — returns whether a row was
    /// actually inserted, the sole authority against double-debit.
    pub async fn insert_usage_event(
        &self,
        tenant_id: &str,
        idem_key: &str,
        amount_micro: i64,
        created_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_event (tenant_id, idem_key, amount_micro, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idem_key) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(idem_key)
        .bind(amount_micro)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Earliest-`expires_at`-first, ties by `created_at`, NULL expiry
    /// treated as `+infinity`.
    pub async fn select_lots_for_debit(&self, tenant_id: &str, amount_micro: i64) -> Result<Vec<LotForDebit>> {
        let rows: Vec<LotForDebit> = sqlx::query_as(
            r#"
            SELECT lot_id, remaining_micro
            FROM credit_lot
            WHERE tenant_id = $1 AND remaining_micro > 0
            ORDER BY COALESCE(expires_at, 'infinity'::timestamptz) ASC, created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut selected = Vec::new();
        let mut remaining_to_cover = amount_micro;
        for row in rows {
            if remaining_to_cover <= 0 {
                break;
            }
            remaining_to_cover -= row.remaining_micro;
            selected.push(row);
        }
        Ok(selected)
    }

    /// `ON CONFLICT (reservation_id) DO NOTHING` so a duplicate debit for
    /// the same reservation is a no-op.
    pub async fn insert_lot_entry(&self, lot_id: &str, reservation_id: &str, amount_micro: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO lot_entry (lot_id, reservation_id, amount_micro)
            VALUES ($1, $2, $3)
            ON CONFLICT (reservation_id) DO NOTHING
            "#,
        )
        .bind(lot_id)
        .bind(reservation_id)
        .bind(amount_micro)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_lot_remaining(&self, lot_id: &str, delta_micro: i64) -> Result<()> {
        sqlx::query("UPDATE credit_lot SET remaining_micro = remaining_micro + $2 WHERE lot_id = $1")
            .bind(lot_id)
            .bind(delta_micro)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_lot_depleted(&self, lot_id: &str) -> Result<()> {
        sqlx::query("UPDATE credit_lot SET depleted_at = now() WHERE lot_id = $1")
            .bind(lot_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The write-behind sync boundary: `update profiles set conviction=?,
    /// activity=?, rank=? where tenantId=? and profileId=?`.
    pub async fn update_profile(
        &self,
        tenant_id: &str,
        profile_id: &str,
        conviction_score: f64,
        activity_score: f64,
        rank: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE profiles SET conviction = $3, activity = $4, rank = $5
            WHERE tenant_id = $1 AND profile_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(profile_id)
        .bind(conviction_score)
        .bind(activity_score)
        .bind(rank)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
