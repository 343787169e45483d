//! Cache manager: typed surface over the store, plus accounting.

use super::key::CacheKey;
use super::store::{CacheStore, EvictionPolicy};
use crate::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    pub enabled: bool,
    pub default_ttl: Duration,
    pub max_entries: usize,
    /// Values larger than this are silently not cached.
    pub max_entry_size: usize,
    pub policy: EvictionPolicy,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(3600),
            max_entries: 1000,
            max_entry_size: 1024 * 1024,
            policy: EvictionPolicy::Lru,
        }
    }
}

impl CacheManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    /// `hits / (hits + misses)`, 0.0 when nothing was looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

/// Keyed, TTL'd, size-bounded store for cacheable operation results.
///
/// Values are serialized to bytes on the way in and deserialized on the way
/// out; a deserialization failure is treated as a miss rather than an error,
/// since a stale shape should never fail a dispatch.
pub struct CacheManager {
    config: CacheManagerConfig,
    store: CacheStore,
    stats: AtomicStats,
}

impl CacheManager {
    pub fn new(config: CacheManagerConfig) -> Self {
        let store = CacheStore::new(config.max_entries.max(1), config.policy);
        Self {
            config,
            store,
            stats: AtomicStats::new(),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        match self.store.get(&key.render()) {
            Some(data) => match serde_json::from_slice(&data) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
                Err(err) => {
                    tracing::warn!(key = %key, "cached value failed to deserialize: {err}");
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.config.default_ttl)
    }

    /// Store a value under a per-operation TTL override.
    pub fn set_with_ttl<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let data = serde_json::to_vec(value)?;
        if data.len() > self.config.max_entry_size {
            tracing::debug!(key = %key, size = data.len(), "entry too large, not cached");
            return Ok(());
        }
        self.store.insert(key.render(), data, ttl);
        self.stats.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        let deleted = self.store.remove(&key.render());
        if deleted {
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        }
        deleted
    }

    /// Remove entries matching `pattern` (substring of the rendered key);
    /// `None` clears everything. Returns the cleared count.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        self.store.clear(pattern)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            sets: self.stats.sets.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            evictions: self.store.eviction_count(),
            expirations: self.store.expiration_count(),
            entries: self.store.len(),
        }
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(CacheManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::fingerprint;
    use serde_json::json;

    fn key(op: &str, params: serde_json::Value) -> CacheKey {
        fingerprint("orch", op, &params)
    }

    #[test]
    fn test_get_set_round_trip() {
        let cache = CacheManager::default();
        let k = key("generate_text", json!({"prompt": "hi"}));

        assert!(cache.get::<String>(&k).is_none());
        cache.set(&k, &"response".to_string()).unwrap();
        assert_eq!(cache.get::<String>(&k).unwrap(), "response");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ttl_override_expires() {
        let cache = CacheManager::default();
        let k = key("generate_text", json!({"prompt": "hi"}));
        cache
            .set_with_ttl(&k, &"v".to_string(), Duration::from_millis(10))
            .unwrap();
        assert!(cache.get::<String>(&k).is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get::<String>(&k).is_none());
    }

    #[test]
    fn test_disabled_cache_is_a_pass_through() {
        let cache = CacheManager::new(CacheManagerConfig::new().with_enabled(false));
        let k = key("generate_text", json!({"prompt": "hi"}));
        cache.set(&k, &"v".to_string()).unwrap();
        assert!(cache.get::<String>(&k).is_none());
        assert_eq!(cache.stats().sets, 0);
    }

    #[test]
    fn test_oversized_entry_not_cached() {
        let config = CacheManagerConfig {
            max_entry_size: 8,
            ..Default::default()
        };
        let cache = CacheManager::new(config);
        let k = key("generate_text", json!({"prompt": "hi"}));
        cache.set(&k, &"a very long response body".to_string()).unwrap();
        assert!(cache.get::<String>(&k).is_none());
    }

    #[test]
    fn test_clear_pattern_by_operation() {
        let cache = CacheManager::default();
        cache
            .set(&key("generate_text", json!({"p": 1})), &1u32)
            .unwrap();
        cache
            .set(&key("generate_text", json!({"p": 2})), &2u32)
            .unwrap();
        cache
            .set(&key("optimize_content", json!({"p": 3})), &3u32)
            .unwrap();

        assert_eq!(cache.clear(Some("generate_text")), 2);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_delete() {
        let cache = CacheManager::default();
        let k = key("chat", json!({"m": "x"}));
        cache.set(&k, &"v".to_string()).unwrap();
        assert!(cache.delete(&k));
        assert!(!cache.delete(&k));
        assert_eq!(cache.stats().deletes, 1);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(CacheManager::default());
        let mut handles = vec![];
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let k = key("generate_text", json!({"t": t, "i": i}));
                    cache.set(&k, &i).unwrap();
                    assert_eq!(cache.get::<i32>(&k).unwrap(), i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().sets, 400);
    }
}
