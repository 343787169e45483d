//! Size-bounded, TTL'd entry store with configurable eviction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Eviction policy applied when the store is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict the least recently accessed entry.
    Lru,
    /// Evict the least frequently accessed entry.
    Lfu,
    /// Evict the oldest entry by insertion order.
    Fifo,
}

#[derive(Clone)]
struct StoreEntry {
    data: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
    hits: u64,
    seq: u64,
}

impl StoreEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// RwLock'd entry map. Expired entries are never returned; they are removed
/// on access or during eviction sweeps.
pub struct CacheStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
    max_entries: usize,
    policy: EvictionPolicy,
    seq: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStore {
    pub fn new(max_entries: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            policy,
            seq: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, StoreEntry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, StoreEntry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.write_entries();
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired() {
                entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.last_accessed = Instant::now();
            entry.hits += 1;
            return Some(entry.data.clone());
        }
        None
    }

    pub fn insert(&self, key: String, data: Vec<u8>, ttl: Duration) {
        let mut entries = self.write_entries();
        self.evict_if_needed(&mut entries);
        let now = Instant::now();
        entries.insert(
            key,
            StoreEntry {
                data,
                created_at: now,
                ttl,
                last_accessed: now,
                hits: 0,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        self.write_entries().remove(key).is_some()
    }

    /// Remove entries whose rendered key contains `pattern`; `None` clears
    /// everything. Returns the number removed.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.write_entries();
        match pattern {
            None => {
                let count = entries.len();
                entries.clear();
                count
            }
            Some(pattern) => {
                let before = entries.len();
                entries.retain(|key, _| !key.contains(pattern));
                before - entries.len()
            }
        }
    }

    /// Count of live (non-expired) entries.
    pub fn len(&self) -> usize {
        self.read_entries()
            .values()
            .filter(|e| !e.is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expiration_count(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    fn evict_if_needed(&self, entries: &mut HashMap<String, StoreEntry>) {
        // Expired entries leave first and don't count as evictions.
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        self.expirations
            .fetch_add((before - entries.len()) as u64, Ordering::Relaxed);

        while entries.len() >= self.max_entries {
            let victim = match self.policy {
                EvictionPolicy::Lru => entries
                    .iter()
                    .min_by_key(|(_, e)| (e.last_accessed, e.seq))
                    .map(|(k, _)| k.clone()),
                EvictionPolicy::Lfu => entries
                    .iter()
                    .min_by_key(|(_, e)| (e.hits, e.seq))
                    .map(|(k, _)| k.clone()),
                EvictionPolicy::Fifo => entries
                    .iter()
                    .min_by_key(|(_, e)| e.seq)
                    .map(|(k, _)| k.clone()),
            };
            if let Some(k) = victim {
                entries.remove(&k);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_expired_entry_never_returned() {
        let store = CacheStore::new(10, EvictionPolicy::Lru);
        store.insert("k".into(), vec![1], Duration::from_millis(10));
        assert!(store.get("k").is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.get("k").is_none());
        assert_eq!(store.expiration_count(), 1);
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let store = CacheStore::new(2, EvictionPolicy::Lru);
        store.insert("a".into(), vec![1], TTL);
        std::thread::sleep(Duration::from_millis(2));
        store.insert("b".into(), vec![2], TTL);
        std::thread::sleep(Duration::from_millis(2));
        // Touch "a" so "b" becomes the LRU victim.
        store.get("a");
        std::thread::sleep(Duration::from_millis(2));
        store.insert("c".into(), vec![3], TTL);

        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
        assert_eq!(store.eviction_count(), 1);
    }

    #[test]
    fn test_lfu_evicts_least_frequently_accessed() {
        let store = CacheStore::new(2, EvictionPolicy::Lfu);
        store.insert("hot".into(), vec![1], TTL);
        store.insert("cold".into(), vec![2], TTL);
        store.get("hot");
        store.get("hot");
        store.get("cold");
        store.insert("new".into(), vec![3], TTL);

        assert!(store.get("hot").is_some());
        assert!(store.get("cold").is_none());
    }

    #[test]
    fn test_fifo_evicts_oldest_insertion() {
        let store = CacheStore::new(2, EvictionPolicy::Fifo);
        store.insert("first".into(), vec![1], TTL);
        store.insert("second".into(), vec![2], TTL);
        // Heavy access doesn't save the oldest under FIFO.
        for _ in 0..10 {
            store.get("first");
        }
        store.insert("third".into(), vec![3], TTL);

        assert!(store.get("first").is_none());
        assert!(store.get("second").is_some());
        assert!(store.get("third").is_some());
    }

    #[test]
    fn test_clear_with_pattern() {
        let store = CacheStore::new(10, EvictionPolicy::Lru);
        store.insert("orch:generate_text:abc".into(), vec![1], TTL);
        store.insert("orch:generate_text:def".into(), vec![2], TTL);
        store.insert("orch:chat:xyz".into(), vec![3], TTL);

        assert_eq!(store.clear(Some("generate_text")), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.clear(None), 1);
        assert!(store.is_empty());
    }
}
