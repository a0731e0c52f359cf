//! Sharded concurrent map used by every per-key store in the engine.
//!
//! Keys hash to one of a fixed number of shards, each guarded by its own
//! `parking_lot::Mutex`. Every operation touches exactly one shard for a given
//! key, so updates are atomic per key while unrelated keys proceed in parallel.
//! Sweeps walk the shards one at a time and never hold two locks at once.

use parking_lot::Mutex;
use std::collections::hash_map::{Entry, RandomState};
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

const DEFAULT_SHARDS: usize = 16;

pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
    hasher: RandomState,
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        Self {
            shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, V>> {
        let index = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[index]
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).lock().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).lock().contains_key(key)
    }

    /// Runs `f` against the entry for `key` while holding its shard lock.
    ///
    /// This is the atomic insert-if-absent / update-if-present primitive all
    /// state transitions are built on.
    pub fn with_entry<R>(&self, key: K, f: impl FnOnce(Entry<'_, K, V>) -> R) -> R {
        let shard = self.shard(&key);
        let mut guard = shard.lock();
        f(guard.entry(key))
    }

    /// Runs `f` against the value for `key`, if present, under its shard lock.
    pub fn with_value<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.shard(key).lock().get_mut(key).map(f)
    }

    /// Removes `key` only when `predicate` holds for its current value.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut guard = self.shard(key).lock();
        if guard.get(key).map(predicate).unwrap_or(false) {
            guard.remove(key)
        } else {
            None
        }
    }

    /// Keeps only entries for which `keep` returns true. Returns the number removed.
    pub fn retain(&self, mut keep: impl FnMut(&K, &mut V) -> bool) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.lock();
            let before = guard.len();
            guard.retain(|k, v| keep(k, v));
            removed += before - guard.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }
}

impl<K: Eq + Hash, V: Clone> ShardedMap<K, V> {
    /// Clone of the value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).lock().get(key).cloned()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ShardedMap<K, V> {
    /// Point-in-time copy of every entry. Shards are copied one after another,
    /// so the result is consistent per key, not across keys.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock();
            out.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }
}

impl<K: Eq + Hash, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
