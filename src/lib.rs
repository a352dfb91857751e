//! # gatekeeper-core
//!
//! Multi-tenant request-gating and economic-accounting core for a
//! community-platform worker.
//!
//! ## Architecture
//!
//! - `error`: the crate-wide error type and `Result` alias
//! - `config`: tier defaults, layer sizing, and per-action limit tables
//! - `substrate`: the [`SharedStore`](substrate::SharedStore) facade over the shared KV/pub-sub store
//! - `cache`: L1 in-process LRU, L2 shared-KV, the multi-layer facade, and the domain-event invalidator
//! - `ratelimit`: multi-dimensional request limiting, tenant tier limiting, and tier→capability resolution
//! - `budget`: reserve/finalize/reap lifecycle over monthly cost envelopes and lot-accurate credit debiting
//! - `writebehind`: coalescing score cache with synchronous authoritative writes and batched replication
//! - `metrics`: counters/gauges/histograms with Prometheus and JSON exposition

pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod substrate;
pub mod writebehind;

pub use budget::{BudgetManager, FinalizeOutcome, FinalizeRequest, ReserveOutcome, ReserveRequest};
pub use cache::{CacheInvalidator, DomainEvent, L1Cache, L2Cache, MultiLayerCache};
pub use error::{GatekeeperError, Result};
pub use metrics::MetricRegistry;
pub use ratelimit::{resolve_tier, validate_alias, RequestRateLimiter, TenantRateLimiter};
pub use substrate::{InMemoryStore, RedisStore, SharedStore};
pub use writebehind::WriteBehindCache;

/// Crate version, as set in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as set in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
