//! waypoint/src/cache.rs
//! Bounded-cost LRU cache (spec.md §4.A), used on hot paths: rule matching,
//! GeoIP lookups, and compiled external rule sets. A single mutex around an
//! intrusive-ordered map keeps the contract simple; callers must not hold
//! it across an `.await`.

use linked_hash_map::LinkedHashMap;
use std::hash::Hash;
use std::sync::Mutex;

struct Entry<V> {
    value: V,
    cost: u64,
}

struct Inner<K: Eq + Hash, V> {
    map: LinkedHashMap<K, Entry<V>>,
    capacity: usize,
    total_cost_limit: u64,
    total_cost: u64,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn evict(&mut self) {
        while self.map.len() > self.capacity || self.total_cost > self.total_cost_limit {
            match self.map.pop_front() {
                Some((_, entry)) => self.total_cost = self.total_cost.saturating_sub(entry.cost),
                None => break,
            }
        }
    }
}

/// A bounded-cost, mutex-serialized LRU. `get`/`set` move the touched entry
/// to the most-recently-used end; overflow of either `capacity` or
/// `total_cost_limit` evicts from the least-recently-used end.
pub struct LruCache<K: Eq + Hash, V: Clone> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize, total_cost_limit: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LinkedHashMap::new(),
                capacity,
                total_cost_limit,
                total_cost: 0,
            }),
        }
    }

    /// Unbounded by count, only by cost.
    pub fn unbounded_by_count(total_cost_limit: u64) -> Self {
        Self::new(usize::MAX, total_cost_limit)
    }

    pub fn set(&self, key: K, value: V, cost: u64) {
        let mut inner = self.inner.lock().unwrap();
        let old_cost = inner.map.get(&key).map(|e| e.cost).unwrap_or(0);
        inner.map.insert(key, Entry { value, cost });
        inner.total_cost = inner.total_cost - old_cost + cost;
        inner.evict();
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        inner.map.get_refresh(key).map(|e| e.value.clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.map.remove(key)?;
        inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        Some(entry.value)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.total_cost = 0;
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lock().unwrap().total_cost
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity;
        inner.evict();
    }

    pub fn total_cost_limit(&self) -> u64 {
        self.inner.lock().unwrap().total_cost_limit
    }

    pub fn set_total_cost_limit(&self, limit: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_cost_limit = limit;
        inner.evict();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let cache = LruCache::new(10, u64::MAX);
        cache.set("a", 1, 1);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn set_replaces_and_adjusts_cost() {
        let cache = LruCache::new(10, u64::MAX);
        cache.set("a", 1, 5);
        cache.set("a", 2, 3);
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.total_cost(), 3);
    }

    #[test]
    fn evicts_least_recently_used_on_capacity_overflow() {
        // Scenario 6: capacity 2, insert (a,1),(b,1), access a, insert (c,1) -> b evicted.
        let cache = LruCache::new(2, u64::MAX);
        cache.set("a", 1, 1);
        cache.set("b", 2, 1);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.set("c", 3, 1);

        assert!(cache.get(&"b").is_none());
        assert!(cache.get(&"a").is_some());
        assert!(cache.get(&"c").is_some());
        assert_eq!(cache.count(), 2);
    }

    #[test]
    fn evicts_on_cost_limit_overflow() {
        let cache = LruCache::new(100, 5);
        cache.set("a", 1, 3);
        cache.set("b", 2, 3);
        assert!(cache.get(&"a").is_none());
        assert_eq!(cache.get(&"b"), Some(2));
        assert!(cache.total_cost() <= 5);
    }

    #[test]
    fn remove_and_clear() {
        let cache = LruCache::new(10, u64::MAX);
        cache.set("a", 1, 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert!(cache.is_empty());

        cache.set("b", 2, 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn empty_cache_never_panics() {
        let cache: LruCache<&str, i32> = LruCache::new(0, 0);
        assert!(cache.get(&"missing").is_none());
        assert!(cache.remove(&"missing").is_none());
        cache.clear();
    }

    #[test]
    fn invariant_holds_after_every_mutation() {
        let cache = LruCache::new(3, 10);
        for i in 0..20u32 {
            cache.set(i, i, 2);
            assert!(cache.count() <= cache.capacity());
            assert!(cache.total_cost() <= cache.total_cost_limit());
        }
    }
}
