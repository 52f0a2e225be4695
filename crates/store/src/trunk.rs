//! Block-scoped write buffer between transaction stores and the root.
//!
//! A trunk store absorbs the dirty sets of many transactions during one
//! block and pushes the net effect into the root store in a single write
//! bracket. Transactions attach to the trunk exactly as they would to the
//! root; the trunk's own lease serializes their snapshot reads against
//! the per-transaction merge-backs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::ads::AuthenticatedStore;
use crate::parent::{ParentStore, StoreWriter};
use crate::root::RootStore;

struct TrunkEntry {
    /// `None` encodes a deletion (when dirty) or a key absent from the
    /// root (when clean).
    value: Option<Vec<u8>>,
    dirty: bool,
}

#[derive(Default)]
struct TrunkCache {
    entries: HashMap<Vec<u8>, TrunkEntry>,
    /// First-touch order; write-back replays dirty entries in this order.
    order: Vec<Vec<u8>>,
}

impl TrunkCache {
    fn install_clean(&mut self, key: &[u8], value: Option<Vec<u8>>) {
        if self.entries.contains_key(key) {
            return; // a dirty entry must not be clobbered by a racing read
        }
        self.order.push(key.to_vec());
        self.entries.insert(key.to_vec(), TrunkEntry { value, dirty: false });
    }

    fn install_dirty(&mut self, key: &[u8], value: Option<Vec<u8>>) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                entry.dirty = true;
            }
            None => {
                self.order.push(key.to_vec());
                self.entries.insert(key.to_vec(), TrunkEntry { value, dirty: true });
            }
        }
    }
}

/// Write buffer for one block over a [`RootStore`].
///
/// Borrows the root; the borrow checker guarantees the root outlives the
/// trunk, and that `write_back` (which consumes the trunk) cannot run
/// while any transaction store still borrows it.
pub struct TrunkStore<'r, A: AuthenticatedStore> {
    lease: RwLock<()>,
    cache: RwLock<TrunkCache>,
    root: &'r RootStore<A>,
    is_writing: AtomicBool,
    read_only: bool,
}

impl<'r, A: AuthenticatedStore> TrunkStore<'r, A> {
    pub(crate) fn new(root: &'r RootStore<A>, read_only: bool) -> Self {
        Self {
            lease: RwLock::new(()),
            cache: RwLock::new(TrunkCache::default()),
            root,
            is_writing: AtomicBool::new(false),
            read_only,
        }
    }

    /// Latest value of `key`: buffered if this block already touched it,
    /// otherwise read through from the root and remembered as clean.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(entry) = self.cache.read().entries.get(key) {
            return entry.value.clone();
        }
        let fetched = self.root.get(key);
        self.cache.write().install_clean(key, fetched.clone());
        fetched
    }

    /// Historical reads pass straight through to the root.
    pub fn get_at_height(&self, key: &[u8], height: u64) -> Option<Vec<u8>> {
        self.root.get_at_height(key, height)
    }

    /// Number of buffered entries whose effect is not yet in the root.
    pub fn dirty_count(&self) -> usize {
        self.cache.read().entries.values().filter(|e| e.dirty).count()
    }

    /// Push the buffered block into the root store inside one exclusive
    /// write bracket, consuming the trunk.
    ///
    /// # Panics
    ///
    /// Panics on a read-only trunk.
    pub fn write_back(self) {
        assert!(!self.read_only, "write back on a read-only trunk store");
        let cache = self.cache.into_inner();
        tracing::debug!(
            touched = cache.order.len(),
            dirty = cache.entries.values().filter(|e| e.dirty).count(),
            "trunk write-back"
        );
        self.root.update(|writer| {
            for key in &cache.order {
                let entry = &cache.entries[key];
                if !entry.dirty {
                    continue;
                }
                match &entry.value {
                    Some(value) => writer.set(key, value),
                    None => writer.delete(key),
                }
            }
        });
    }
}

struct TrunkWriter<'a> {
    cache: &'a mut TrunkCache,
}

impl StoreWriter for TrunkWriter<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.cache.install_dirty(key, Some(value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.cache.install_dirty(key, None);
    }
}

impl<A: AuthenticatedStore> ParentStore for TrunkStore<'_, A> {
    fn rlock(&self) -> RwLockReadGuard<'_, ()> {
        self.lease.read()
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        TrunkStore::get(self, key)
    }

    fn get_at_height(&self, key: &[u8], height: u64) -> Option<Vec<u8>> {
        TrunkStore::get_at_height(self, key, height)
    }

    fn prepare_for_update(&self, key: &[u8]) {
        ParentStore::prepare_for_update(self.root, key);
    }

    fn prepare_for_deletion(&self, key: &[u8]) {
        ParentStore::prepare_for_deletion(self.root, key);
    }

    /// A transaction's merge-back lands in the trunk cache only; the root
    /// sees nothing until [`TrunkStore::write_back`].
    fn update(&self, updater: &mut dyn FnMut(&mut dyn StoreWriter)) {
        assert!(!self.read_only, "update on a read-only trunk store");
        let _guard = self.lease.write();
        assert!(
            !self.is_writing.swap(true, Ordering::AcqRel),
            "update while another update is in progress"
        );
        let mut cache = self.cache.write();
        let mut writer = TrunkWriter { cache: &mut cache };
        updater(&mut writer);
        drop(cache);
        self.is_writing.store(false, Ordering::Release);
    }
}
