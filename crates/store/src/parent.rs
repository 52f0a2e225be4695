//! Contracts between a transaction store and its parent.

use parking_lot::RwLockReadGuard;

/// Sink for the set/delete sequence of a write bracket.
///
/// Handed to [`ParentStore::update`] callbacks; a transaction's dirty
/// entries are replayed through it in insertion order.
pub trait StoreWriter {
    /// Write `key → value` into the parent.
    fn set(&mut self, key: &[u8], value: &[u8]);
    /// Delete `key` from the parent.
    fn delete(&mut self, key: &[u8]);
}

/// A store a transaction can attach to: a root store or a trunk store.
///
/// The parent outlives its transactions. Each transaction holds the
/// parent's shared lease from creation to close, so a block writer (which
/// needs the exclusive side) cannot begin until every outstanding snapshot
/// reader has released.
pub trait ParentStore {
    /// Acquire the shared lease. Blocks while a writer is in progress.
    fn rlock(&self) -> RwLockReadGuard<'_, ()>;

    /// Latest value of `key`.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Value of `key` as of block `height`.
    fn get_at_height(&self, key: &[u8], height: u64) -> Option<Vec<u8>>;

    /// Announce an upcoming write of `key` so the authenticated store can
    /// pre-warm the affected Merkle paths.
    fn prepare_for_update(&self, key: &[u8]);

    /// Announce an upcoming deletion of `key`.
    fn prepare_for_deletion(&self, key: &[u8]);

    /// Run `updater` inside the exclusive write bracket. The only
    /// supported way to merge a transaction's dirty set back.
    fn update(&self, updater: &mut dyn FnMut(&mut dyn StoreWriter));
}
