//! Rate-limiting subsystem: the multi-dimensional request limiter, the
//! tenant tier limiter, and the tier→capability resolver (spec §4.4–§4.6).

pub mod capability;
pub mod request;
pub mod tenant;

pub use capability::{resolve as resolve_tier, validate as validate_alias, TierDescriptor};
pub use request::{RequestCheckContext, RequestCheckResult, RequestRateLimiter};
pub use tenant::{TenantCheckResult, TenantRateLimiter};
