//! Sharded in-memory cache.
//!
//! A fixed number of shards (power of two), each an independent
//! `RwLock<HashMap>`. The shard for a key is picked by mixing the key's hash
//! and masking; concurrent reads on different shards never contend. Entities
//! are independent so no cross-shard atomicity is provided.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::RwLock;

/// Sharded map with per-shard read-write locks.
pub struct ShardedCache<K, V> {
    shards: Vec<RwLock<HashMap<K, V>>>,
    shard_mask: u64,
    hasher: RandomState,
}

impl<K, V> ShardedCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache with `shards` shards, rounded up to a power of two.
    /// A non-positive count falls back to 16.
    pub fn new(shards: usize) -> Self {
        let count = if shards == 0 {
            16
        } else {
            shards.next_power_of_two()
        };
        let shards = (0..count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            shard_mask: (count - 1) as u64,
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let hashed = self.hasher.hash_one(key);
        &self.shards[(hashed & self.shard_mask) as usize]
    }

    pub fn set(&self, key: K, value: V) {
        let mut shard = self.shard(&key).write().unwrap();
        shard.insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let shard = self.shard(key).read().unwrap();
        shard.get(key).cloned()
    }

    /// Snapshot of all entries across every shard.
    pub fn get_all(&self) -> HashMap<K, V> {
        let mut result = HashMap::new();
        for shard in &self.shards {
            let guard = shard.read().unwrap();
            for (k, v) in guard.iter() {
                result.insert(k.clone(), v.clone());
            }
        }
        result
    }

    /// Delete the given keys, returning how many existed.
    pub fn del(&self, keys: &[K]) -> usize {
        let mut count = 0;
        for key in keys {
            let mut shard = self.shard(key).write().unwrap();
            if shard.remove(key).is_some() {
                count += 1;
            }
        }
        count
    }

    /// True iff every given key is present.
    pub fn exists(&self, keys: &[K]) -> bool {
        keys.iter().all(|k| self.get(k).is_some())
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().unwrap().clear();
        }
    }
}
