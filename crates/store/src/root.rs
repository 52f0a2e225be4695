//! The root store: one logical versioned store over the authenticated
//! data store, with a bounded height-tagged cache in front.
//!
//! The cache is write-through: values written during a block are also
//! written to the authenticated store, and a cache miss always has the
//! store to fall back on. Misses do not populate the cache: cold read
//! traffic must not push out recently written entries.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

use vellum_types::{ConfigError, Height, StoreConfig, UNSET_HEIGHT};

use crate::ads::AuthenticatedStore;
use crate::cache::ShardedCache;
use crate::parent::{ParentStore, StoreWriter};
use crate::trunk::TrunkStore;

/// Decides which keys are admitted to the root cache. When no predicate
/// is configured the cache is disabled entirely.
pub type CacheablePredicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Root store over an authenticated data store.
///
/// One root store serves many trunk and transaction stores. There is a
/// single writer and many snapshot readers: the writer runs inside
/// [`update`](Self::update) under the exclusive side of the lease, while
/// readers hold the shared side for the lifetime of their transaction
/// store. `parking_lot`'s RwLock does not starve writers, which this
/// design depends on.
///
/// The cache and the authenticated store are both guarded by that lease;
/// the cache shards carry their own locks only so reads need no exclusive
/// access.
pub struct RootStore<A: AuthenticatedStore> {
    lease: RwLock<()>,
    cache: ShardedCache,
    is_cacheable: Option<CacheablePredicate>,
    ads: A,
    /// Current block height; every new cache entry carries it as an age
    /// tag. Starts at the unset sentinel.
    height: AtomicI64,
    is_writing: AtomicBool,
    max_key_length: usize,
}

impl<A: AuthenticatedStore> RootStore<A> {
    /// Create a root store over `ads`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` fails validation.
    pub fn new(
        ads: A,
        config: StoreConfig,
        is_cacheable: Option<CacheablePredicate>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            lease: RwLock::new(()),
            cache: ShardedCache::new(config.cache_size_limit, config.evict_try_dist),
            is_cacheable,
            ads,
            height: AtomicI64::new(UNSET_HEIGHT),
            is_writing: AtomicBool::new(false),
            max_key_length: config.max_key_length,
        })
    }

    /// Record the block height carried by subsequent writes.
    pub fn set_height(&self, height: Height) {
        self.height.store(height, Ordering::Release);
    }

    /// Latest value of `key`: from the cache when admitted and resident,
    /// otherwise from the authenticated store. Misses do not populate the
    /// cache.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if self.admits(key) {
            let shard = self.ads.shard_id(key);
            if let Some(value) = self.cache.get(shard, key) {
                return Some(value);
            }
        }
        self.ads.get(key)
    }

    /// Value of `key` as of block `height`. Historical reads bypass the
    /// cache entirely.
    pub fn get_at_height(&self, key: &[u8], height: u64) -> Option<Vec<u8>> {
        self.ads.get_at_height(key, height)
    }

    /// Write `key → value` through to the authenticated store, refreshing
    /// the cache entry when the key is admitted.
    ///
    /// # Panics
    ///
    /// Panics outside a write bracket, or when the key exceeds the
    /// configured maximum length.
    pub fn set(&self, key: &[u8], value: &[u8]) {
        assert!(
            self.is_writing.load(Ordering::Acquire),
            "set outside a write bracket"
        );
        assert!(
            key.len() <= self.max_key_length,
            "key length {} exceeds the maximum {}",
            key.len(),
            self.max_key_length
        );
        self.ads.set(key, value);
        if self.admits(key) {
            let shard = self.ads.shard_id(key);
            self.cache.insert(shard, key, value, self.height.load(Ordering::Acquire));
        }
    }

    /// Delete `key` from the authenticated store and unconditionally from
    /// the cache.
    ///
    /// # Panics
    ///
    /// Panics outside a write bracket.
    pub fn delete(&self, key: &[u8]) {
        assert!(
            self.is_writing.load(Ordering::Acquire),
            "delete outside a write bracket"
        );
        self.ads.delete(key);
        let shard = self.ads.shard_id(key);
        self.cache.remove(shard, key);
    }

    /// Open the write bracket, forwarding the recorded height to the
    /// authenticated store.
    ///
    /// # Panics
    ///
    /// Panics when no height has been set, or when a bracket is already
    /// open.
    pub fn begin_write(&self) {
        let height = self.height.load(Ordering::Acquire);
        assert!(height >= 0, "height is not initialized: {height}");
        assert!(
            !self.is_writing.swap(true, Ordering::AcqRel),
            "begin_write while a write bracket is already open"
        );
        self.ads.begin_write(height);
    }

    /// Close the write bracket.
    pub fn end_write(&self) {
        assert!(
            self.is_writing.load(Ordering::Acquire),
            "end_write without begin_write"
        );
        self.ads.end_write();
        self.is_writing.store(false, Ordering::Release);
    }

    /// Run `updater` under the exclusive lease with the write bracket
    /// open. This is the only supported path for transaction merge-back:
    /// it cannot interleave with snapshot readers, and the
    /// begin/set/delete/end sequence cannot be skipped or reordered.
    pub fn update(&self, updater: impl FnOnce(&mut dyn StoreWriter)) {
        let _guard = self.lease.write();
        self.begin_write();
        let mut writer = RootWriter { root: self };
        updater(&mut writer);
        self.end_write();
    }

    /// Block-scoped write buffer over this root store.
    pub fn trunk_store(&self) -> TrunkStore<'_, A> {
        TrunkStore::new(self, false)
    }

    /// Read-only variant of [`trunk_store`](Self::trunk_store).
    pub fn read_only_trunk_store(&self) -> TrunkStore<'_, A> {
        TrunkStore::new(self, true)
    }

    /// Root commitment over the live state.
    pub fn root_hash(&self) -> Vec<u8> {
        self.ads.root_hash()
    }

    /// Number of live entries in the authenticated store.
    pub fn active_count(&self) -> usize {
        self.ads.active_count()
    }

    /// Shard assignment for `key`, as supplied by the authenticated store.
    pub fn shard_id(&self, key: &[u8]) -> usize {
        self.ads.shard_id(key)
    }

    /// Borrow the underlying authenticated store, for host-driven
    /// maintenance such as pruning. Writes must still go through this
    /// store's brackets.
    pub fn authenticated_store(&self) -> &A {
        &self.ads
    }

    /// Number of cache entries currently resident in `shard`.
    pub fn cache_shard_len(&self, shard: usize) -> usize {
        self.cache.shard_len(shard)
    }

    /// Close the authenticated store and drop every cache entry.
    pub fn close(&self) {
        self.ads.close();
        self.cache.clear();
    }

    fn admits(&self, key: &[u8]) -> bool {
        match &self.is_cacheable {
            Some(predicate) => predicate(key),
            None => false,
        }
    }
}

struct RootWriter<'a, A: AuthenticatedStore> {
    root: &'a RootStore<A>,
}

impl<A: AuthenticatedStore> StoreWriter for RootWriter<'_, A> {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.root.set(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.root.delete(key);
    }
}

impl<A: AuthenticatedStore> ParentStore for RootStore<A> {
    fn rlock(&self) -> RwLockReadGuard<'_, ()> {
        self.lease.read()
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        RootStore::get(self, key)
    }

    fn get_at_height(&self, key: &[u8], height: u64) -> Option<Vec<u8>> {
        RootStore::get_at_height(self, key, height)
    }

    fn prepare_for_update(&self, key: &[u8]) {
        self.ads.prepare_for_update(key);
    }

    fn prepare_for_deletion(&self, key: &[u8]) {
        self.ads.prepare_for_deletion(key);
    }

    fn update(&self, updater: &mut dyn FnMut(&mut dyn StoreWriter)) {
        RootStore::update(self, |writer| updater(writer));
    }
}
