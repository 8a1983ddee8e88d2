//! Small bounded caches used by the persistent-store wrapper, the Big Segment bridge, and the
//! event pipeline's context deduplicator.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A bounded map whose entries expire after a fixed TTL. Insertion order is used for eviction
/// when the capacity is exceeded.
#[derive(Debug)]
pub(crate) struct ExpiringCache<K, V> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<K, (u64, Instant, V)>,
    // Insertion sequence -> key, for oldest-first eviction.
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> ExpiringCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        ExpiringCache {
            capacity,
            ttl,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let (_, inserted_at, value) = self.entries.get(key)?;
        if inserted_at.elapsed() >= self.ttl {
            self.remove(key);
            return None;
        }
        Some(value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.remove(&key);
        while self.entries.len() >= self.capacity {
            let Some((&oldest_seq, _)) = self.order.iter().next() else {
                break;
            };
            let oldest_key = self.order.remove(&oldest_seq).unwrap();
            self.entries.remove(&oldest_key);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key, (seq, Instant::now(), value));
    }

    pub fn remove(&mut self, key: &K) {
        if let Some((seq, _, _)) = self.entries.remove(key) {
            self.order.remove(&seq);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// A bounded set of keys with least-recently-used eviction. `notice` reports whether the key was
/// already present, refreshing its recency either way.
#[derive(Debug)]
pub(crate) struct LruKeySet<K> {
    capacity: usize,
    entries: HashMap<K, u64>,
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone> LruKeySet<K> {
    pub fn new(capacity: usize) -> Self {
        LruKeySet {
            capacity,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn notice(&mut self, key: K) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(old_seq) = self.entries.insert(key.clone(), seq) {
            self.order.remove(&old_seq);
            self.order.insert(seq, key);
            return true;
        }
        self.order.insert(seq, key);
        while self.entries.len() > self.capacity {
            let (&lru_seq, _) = self.order.iter().next().unwrap();
            let lru_key = self.order.remove(&lru_seq).unwrap();
            self.entries.remove(&lru_key);
        }
        false
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiring_cache_returns_inserted_values() {
        let mut cache = ExpiringCache::new(10, Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn expiring_cache_expires() {
        let mut cache = ExpiringCache::new(10, Duration::ZERO);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn expiring_cache_evicts_oldest_at_capacity() {
        let mut cache = ExpiringCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn lru_set_reports_repeats() {
        let mut seen = LruKeySet::new(10);
        assert!(!seen.notice("a"));
        assert!(seen.notice("a"));
    }

    #[test]
    fn lru_set_evicts_least_recently_used() {
        let mut seen = LruKeySet::new(2);
        seen.notice("a");
        seen.notice("b");
        // Refresh "a" so "b" is now least recently used.
        seen.notice("a");
        seen.notice("c");
        assert!(!seen.notice("b"), "b should have been evicted");
        assert!(seen.notice("a"));
    }
}
