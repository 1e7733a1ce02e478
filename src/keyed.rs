// ===============================
// src/keyed.rs (sharded keyed store)
// ===============================
//
// Map string-key -> V yang dipecah ke beberapa shard, masing-masing dengan
// RwLock sendiri. Dipakai untuk registry koneksi DLL dan tabel user state.
// Setiap method hanya memegang satu lock shard dalam satu waktu.
//
use std::hash::BuildHasher;

use ahash::{AHashMap as HashMap, RandomState};
use parking_lot::RwLock;

const DEFAULT_SHARDS: usize = 16;

pub struct ShardedMap<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
    hasher: RandomState,
}

impl<V: Clone> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> ShardedMap<V> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(n: usize) -> Self {
        let n = n.max(1);
        Self {
            shards: (0..n).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    /// Insert `value` unless the key is already present; either way return
    /// the value that ends up stored.
    pub fn get_or_insert(&self, key: &str, value: V) -> V {
        self.shard(key)
            .write()
            .entry(key.to_string())
            .or_insert(value)
            .clone()
    }

    /// Insert and return the previous value, if any.
    pub fn insert(&self, key: &str, value: V) -> Option<V> {
        self.shard(key).write().insert(key.to_string(), value)
    }

    /// Remove the entry only while `pred` holds for the stored value.
    pub fn remove_if(&self, key: &str, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut guard = self.shard(key).write();
        if guard.get(key).map(pred).unwrap_or(false) {
            guard.remove(key)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Point-in-time copy of all values, shard by shard.
    pub fn values(&self) -> Vec<V> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            out.extend(shard.read().values().cloned());
        }
        out
    }

    /// First value (in shard iteration order) matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&V) -> bool) -> Option<V> {
        for shard in &self.shards {
            if let Some(v) = shard.read().values().find(|v| pred(v)) {
                return Some(v.clone());
            }
        }
        None
    }

    /// Visit every entry holding each shard's write lock while it is visited.
    pub fn for_each_exclusive(&self, mut f: impl FnMut(&str, &mut V)) {
        for shard in &self.shards {
            let mut guard = shard.write();
            for (k, v) in guard.iter_mut() {
                f(k, v);
            }
        }
    }
}
