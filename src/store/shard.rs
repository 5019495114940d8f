//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two RwLock shards so that heavy
//! traffic on a few keys only contends within one shard.
//!
//! # Design
//!
//! - Each shard has its own RwLock; readers never block each other
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Shards are cache-line aligned to prevent false sharing

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Single shard containing a hashmap and statistics
#[repr(align(64))]
struct Shard<K, V> {
    /// The hashmap for this shard
    map: RwLock<HashMap<K, V>>,
    /// Total size of values (in bytes)
    size_bytes: AtomicU64,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            size_bytes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Get the number of entries in this shard
    fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Get total size of values in bytes
    fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(key).cloned()
    }

    fn contains_key(&self, key: &K) -> bool {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().contains_key(key)
    }

    /// Insert or replace; size accounting follows the stored value
    fn insert(&self, key: K, value: V, value_size: u64, old_size: impl Fn(&V) -> u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        if let Some(old) = guard.insert(key, value) {
            self.size_bytes.fetch_sub(old_size(&old), Ordering::Relaxed);
        }
        self.size_bytes.fetch_add(value_size, Ordering::Relaxed);
    }

    fn remove(&self, key: &K, size_of: impl Fn(&V) -> u64) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let removed = self.map.write().remove(key)?;
        self.size_bytes.fetch_sub(size_of(&removed), Ordering::Relaxed);
        Some(removed)
    }
}

/// Sharded map with a power-of-two shard count
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    mask: usize,
}

impl<K, V> ShardedMap<K, V> {
    /// Create a map; `shard_count` is rounded up to a power of two
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        Self {
            shards: (0..count).map(|_| Shard::new()).collect(),
            mask: count - 1,
        }
    }

    /// Get the shard count
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get total size in bytes across all shards
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.size_bytes()).sum()
    }

    /// Get total read count
    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.reads.load(Ordering::Relaxed)).sum()
    }

    /// Get total write count
    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.writes.load(Ordering::Relaxed)).sum()
    }
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.mask]
    }

    /// Get a value
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard(key).get(key)
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).contains_key(key)
    }

    /// Insert or replace a value
    pub fn insert(&self, key: K, value: V, value_size: u64, old_size: impl Fn(&V) -> u64) {
        self.shard(&key).insert(key, value, value_size, old_size)
    }

    /// Remove a value, releasing its size
    pub fn remove(&self, key: &K, size_of: impl Fn(&V) -> u64) -> Option<V> {
        self.shard(key).remove(key, size_of)
    }

    /// Visit every entry, one shard read lock at a time
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for shard in self.shards.iter() {
            for (key, value) in shard.map.read().iter() {
                f(key, value);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn size_of(v: &Vec<u8>) -> u64 {
        v.len() as u64
    }

    #[test]
    fn test_shard_count_rounds_up() {
        assert_eq!(ShardedMap::<u32, u32>::new(0).shard_count(), 1);
        assert_eq!(ShardedMap::<u32, u32>::new(5).shard_count(), 8);
        assert_eq!(ShardedMap::<u32, u32>::new(64).shard_count(), 64);
    }

    #[test]
    fn test_insert_get_replace() {
        let map: ShardedMap<String, Vec<u8>> = ShardedMap::new(16);
        map.insert("a".into(), vec![0; 10], 10, size_of);
        map.insert("b".into(), vec![0; 5], 5, size_of);
        assert_eq!(map.len(), 2);
        assert_eq!(map.size_bytes(), 15);

        map.insert("a".into(), vec![1; 3], 3, size_of);
        assert_eq!(map.len(), 2);
        assert_eq!(map.size_bytes(), 8);
        assert_eq!(map.get(&"a".to_string()), Some(vec![1; 3]));
        assert!(map.contains_key(&"b".to_string()));
        assert!(!map.contains_key(&"c".to_string()));
        assert_eq!(map.total_writes(), 3);
        assert_eq!(map.total_reads(), 3);
    }

    #[test]
    fn test_remove_and_scan() {
        let map: ShardedMap<u32, Vec<u8>> = ShardedMap::new(4);
        for i in 0..10u32 {
            map.insert(i, vec![0; i as usize], i as u64, size_of);
        }
        assert_eq!(map.size_bytes(), 45);

        assert_eq!(map.remove(&9, size_of), Some(vec![0; 9]));
        assert_eq!(map.remove(&9, size_of), None);
        assert_eq!(map.size_bytes(), 36);

        let mut seen = Vec::new();
        map.for_each(|k, _| seen.push(*k));
        seen.sort_unstable();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_access() {
        let map: Arc<ShardedMap<u64, u64>> = Arc::new(ShardedMap::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        let key = i % 16;
                        map.insert(key, key * 10, 8, |_| 8);
                        assert_eq!(map.get(&key), Some(key * 10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 16);
        assert_eq!(map.size_bytes(), 16 * 8);
    }
}
