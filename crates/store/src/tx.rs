//! Per-transaction cache and write buffer.
//!
//! A transaction store isolates one transaction's reads and writes from
//! its parent (a root or trunk store). Reads are served from a local
//! cache that faults in parent state on first touch; writes stay local
//! until the transaction is closed and merged back. The parent's shared
//! lease, held from creation to close, pins the snapshot the transaction
//! observes.

use std::collections::HashMap;

use parking_lot::RwLockReadGuard;

use crate::parent::ParentStore;

/// Sentinel height marking a non-historical transaction.
const NOT_HISTORICAL: u64 = u64::MAX;

struct CachedValue {
    /// `None` encodes a locally deleted key; such entries are always
    /// dirty, because parent misses are never installed.
    value: Option<Vec<u8>>,
    dirty: bool,
}

#[derive(Default)]
struct TxCache {
    entries: HashMap<Vec<u8>, CachedValue>,
    /// First-touch order; the dirty scan replays in this order.
    order: Vec<Vec<u8>>,
}

impl TxCache {
    fn install(&mut self, key: &[u8], entry: CachedValue) {
        match self.entries.get_mut(key) {
            Some(existing) => *existing = entry,
            None => {
                self.order.push(key.to_vec());
                self.entries.insert(key.to_vec(), entry);
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TxState {
    Open,
    Closed,
    WrittenBack,
}

/// Transaction store over a parent.
///
/// The parent is a borrowed handle: it always outlives the transaction,
/// and the shared lease taken at creation keeps block writers out until
/// [`close`](Self::close) releases it. `write_back` is only legal after
/// close; the shared lease must be gone before the parent's exclusive
/// lease can be taken, or the merge-back would deadlock against itself.
pub struct TxStore<'p, P: ParentStore + ?Sized> {
    cache: TxCache,
    parent: &'p P,
    lease: Option<RwLockReadGuard<'p, ()>>,
    state: TxState,
    /// Target height for historical reads; [`NOT_HISTORICAL`] at head.
    height: u64,
    read_only: bool,
}

impl<'p, P: ParentStore + ?Sized> TxStore<'p, P> {
    /// Read-write transaction at the parent's latest state.
    pub fn new(parent: &'p P) -> Self {
        Self::with_mode(parent, false, NOT_HISTORICAL)
    }

    /// Read-only transaction at the parent's latest state.
    pub fn read_only(parent: &'p P) -> Self {
        Self::with_mode(parent, true, NOT_HISTORICAL)
    }

    /// Read-only transaction pinned to block `height`.
    pub fn read_only_at_height(parent: &'p P, height: u64) -> Self {
        Self::with_mode(parent, true, height)
    }

    fn with_mode(parent: &'p P, read_only: bool, height: u64) -> Self {
        let lease = parent.rlock();
        Self {
            cache: TxCache::default(),
            parent,
            lease: Some(lease),
            state: TxState::Open,
            height,
            read_only,
        }
    }

    fn is_historical(&self) -> bool {
        self.height != NOT_HISTORICAL
    }

    fn assert_open(&self) {
        assert!(self.state == TxState::Open, "transaction store accessed after close");
    }

    /// Value of `key` as this transaction observes it.
    ///
    /// Locally deleted keys read as absent. On a cache miss the parent is
    /// consulted (`get` at head, `get_at_height` when pinned) and a found
    /// value is installed as a clean entry; parent misses are not cached.
    ///
    /// # Panics
    ///
    /// Panics after close.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.assert_open();
        if let Some(entry) = self.cache.entries.get(key) {
            return entry.value.clone();
        }
        let fetched = if self.is_historical() {
            self.parent.get_at_height(key, self.height)
        } else {
            self.parent.get(key)
        };
        let value = fetched?;
        self.cache.install(key, CachedValue { value: Some(value.clone()), dirty: false });
        Some(value)
    }

    /// Like [`get`](Self::get), but the entry must already be cached.
    /// Used where earlier code has declared the key dirty and re-reading
    /// the parent would be a logic error.
    ///
    /// # Panics
    ///
    /// Panics after close, or when the key has never been touched.
    pub fn must_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.assert_open();
        match self.cache.entries.get(key) {
            Some(entry) => entry.value.clone(),
            None => panic!("key is not in the transaction cache"),
        }
    }

    /// Buffer `key → value` locally and announce the upcoming write to
    /// the parent so Merkle paths can be pre-warmed.
    ///
    /// # Panics
    ///
    /// Panics after close or on a read-only transaction.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.assert_open();
        assert!(!self.read_only, "write on a read-only transaction store");
        self.cache.install(key, CachedValue { value: Some(value.to_vec()), dirty: true });
        self.parent.prepare_for_update(key);
    }

    /// Buffer a deletion of `key` locally.
    ///
    /// # Panics
    ///
    /// Panics after close or on a read-only transaction.
    pub fn delete(&mut self, key: &[u8]) {
        self.assert_open();
        assert!(!self.read_only, "write on a read-only transaction store");
        self.cache.install(key, CachedValue { value: None, dirty: true });
        self.parent.prepare_for_deletion(key);
    }

    /// Release the parent's shared lease. Idempotent; all other access
    /// after close is fatal.
    pub fn close(&mut self) {
        if self.state != TxState::Open {
            return;
        }
        self.lease = None;
        self.state = TxState::Closed;
    }

    /// Merge the dirty entries back into the parent, in first-touch
    /// order, inside the parent's exclusive write bracket.
    ///
    /// # Panics
    ///
    /// Panics on a read-only transaction, before [`close`](Self::close),
    /// or when called twice.
    pub fn write_back(&mut self) {
        assert!(!self.read_only, "write back on a read-only transaction store");
        match self.state {
            TxState::Open => panic!("write back before close"),
            TxState::WrittenBack => panic!("write back called twice"),
            TxState::Closed => {}
        }
        let cache = &self.cache;
        self.parent.update(&mut |writer| {
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
        self.state = TxState::WrittenBack;
    }
}
