//! Sharded, bounded, height-tagged value cache for the root store.
//!
//! Each shard is an independent map from key bytes to `(height, value)`.
//! The height is the block at which the entry was written, an age tag.
//! Eviction is approximate-LRU by height: cache inserts arrive in block
//! order, so height approximates age without tracking per-entry access
//! times, and sampling a bounded number of entries keeps the eviction
//! cost O(1).

use std::collections::HashMap;

use parking_lot::RwLock;

use vellum_types::{Height, SHARD_COUNT};

struct CacheEntry {
    /// Block height at which this entry was inserted.
    height: Height,
    value: Vec<u8>,
}

/// Fixed-shard cache with min-height sampling eviction.
pub(crate) struct ShardedCache {
    shards: [RwLock<HashMap<Vec<u8>, CacheEntry>>; SHARD_COUNT],
    size_limit: usize,
    evict_try_dist: usize,
}

impl ShardedCache {
    pub(crate) fn new(size_limit: usize, evict_try_dist: usize) -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
            size_limit,
            evict_try_dist,
        }
    }

    /// Cloned value for `key`, if cached in `shard`.
    pub(crate) fn get(&self, shard: usize, key: &[u8]) -> Option<Vec<u8>> {
        self.shards[shard].read().get(key).map(|e| e.value.clone())
    }

    /// Insert or refresh `key` with the given age tag, evicting first if
    /// the shard is at its limit.
    ///
    /// The victim is the minimum-height entry among a sample of at most
    /// `evict_try_dist` entries in the map's (unspecified) iteration
    /// order; a non-empty shard always yields one, so a shard never
    /// holds more than `size_limit` entries.
    pub(crate) fn insert(&self, shard: usize, key: &[u8], value: &[u8], height: Height) {
        let mut entries = self.shards[shard].write();
        if entries.len() >= self.size_limit && !entries.contains_key(key) {
            let victim = entries
                .iter()
                .take(self.evict_try_dist)
                .min_by_key(|(_, e)| e.height)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }
        entries.insert(key.to_vec(), CacheEntry { height, value: value.to_vec() });
    }

    /// Drop `key` from `shard`, if present.
    pub(crate) fn remove(&self, shard: usize, key: &[u8]) {
        self.shards[shard].write().remove(key);
    }

    /// Number of entries currently held by `shard`.
    pub(crate) fn shard_len(&self, shard: usize) -> usize {
        self.shards[shard].read().len()
    }

    /// Drop every entry in every shard.
    pub(crate) fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}
