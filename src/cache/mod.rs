//! Caching subsystem: L1 in-process LRU, L2 shared-KV, the multi-layer
//! facade composing them, a structured key scheme, and the domain-event
//! invalidator (spec §4.1–§4.3, §4.9).

pub mod invalidator;
pub mod keys;
pub mod l1;
pub mod l2;
pub mod multilayer;

pub use invalidator::{CacheInvalidator, DomainEvent};
pub use l1::L1Cache;
pub use l2::L2Cache;
pub use multilayer::{CacheLayer, CacheResult, MultiLayerCache};
