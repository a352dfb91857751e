//! Crate-wide error type.
//!
//! Every subsystem returns [`GatekeeperError`] for the unexpected case and a
//! typed, non-error result (`CheckResult`, `ReserveOutcome`, ...) for the
//! expected case — a rate-limit denial or a budget shortfall is not an error,
//! it is a normal outcome of the admission pipeline.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error("shared KV store is not connected")]
    NotConnected,

    #[error("tier {0} is outside the valid range [1..9]")]
    InvalidTier(i64),

    #[error("budget exceeded for tenant {tenant_id}")]
    BudgetExceeded { tenant_id: String },

    #[error("reservation {idem_key} for tenant {tenant_id} was already finalized")]
    AlreadyFinalized {
        tenant_id: String,
        idem_key: String,
    },

    #[error("no reservation {idem_key} found for tenant {tenant_id}")]
    NotReserved {
        tenant_id: String,
        idem_key: String,
    },

    #[error("stale fence token {given} for tenant {tenant_id} (stored: {stored})")]
    StaleFence {
        tenant_id: String,
        given: i64,
        stored: i64,
    },

    #[error("transient store error: {0}")]
    TransientStoreError(String),

    #[error("permanent store error: {0}")]
    PermanentStoreError(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("relational store error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GatekeeperError {
    /// Whether `NODE_ENV` permits including developer-facing detail (stack
    /// traces, internal error strings) in an outward-facing payload.
    pub fn development_mode_active() -> bool {
        std::env::var("NODE_ENV")
            .map(|v| v != "production")
            .unwrap_or(true)
    }

    /// A short, sanitized message safe to surface to a caller regardless of
    /// environment, per the error handling design's "sanitized message" rule.
    pub fn sanitized_message(&self) -> &'static str {
        match self {
            Self::NotConnected => "service temporarily unavailable",
            Self::InvalidTier(_) => "invalid tier",
            Self::BudgetExceeded { .. } => "budget exceeded",
            Self::AlreadyFinalized { .. } => "already finalized",
            Self::NotReserved { .. } => "no matching reservation",
            Self::StaleFence { .. } => "stale fence token",
            Self::TransientStoreError(_) => "temporary storage error",
            Self::PermanentStoreError(_) => "storage error",
            Self::Redis(_) | Self::Sqlx(_) | Self::Serde(_) => "internal error",
        }
    }
}
