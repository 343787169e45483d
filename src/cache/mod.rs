//! 响应缓存模块：幂等操作结果的带 TTL、限容缓存。
//!
//! # Cache Module
//!
//! Keyed, TTL'd, size-bounded store for cacheable operation results.
//!
//! Keys are fingerprints over `{namespace, operation, normalized request
//! parameters}`: identical logical requests hash identically regardless of
//! field ordering ([`key`]). Values are stored as serialized bytes; the
//! [`manager`] provides the typed surface and the hit/miss accounting, the
//! [`store`] enforces TTL and the configured eviction policy.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheKey`] / [`fingerprint`](key::fingerprint) | Deterministic request fingerprinting |
//! | [`CacheStore`](store::CacheStore) | TTL'd map with LRU/LFU/FIFO eviction |
//! | [`CacheManager`] | Typed get/set, per-op TTL override, stats |

pub mod key;
pub mod manager;
pub mod store;

pub use key::CacheKey;
pub use manager::{CacheManager, CacheManagerConfig, CacheStats};
pub use store::EvictionPolicy;
