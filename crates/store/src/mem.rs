//! In-memory authenticated store: the reference implementation of the
//! [`AuthenticatedStore`] contract.
//!
//! A working miniature of the external engine, small enough to reason
//! about but exercising the full stack:
//!
//! - An append-only value log; a record's position is its log offset.
//! - A [`VersionedIndex`] mapping `seahash(key)` to the latest position,
//!   with per-height history behind it, so `get_at_height` resolves the
//!   same way the production store does.
//! - A SHA-256 commitment over the live entries, length-prefixed and
//!   folded in index order so every instance of the same state agrees.
//!
//! Writes are staged between `begin_write` and `end_write` and applied to
//! the index in one bracket at `end_write`, which also commits the
//! history batch, matching the per-block commit cadence of a durable log.
//!
//! The 64-bit key identifiers are hashes, so two logical keys can
//! collide. The log record keeps the full key and reads verify it; a
//! collision therefore shadows the older key instead of returning its
//! value. Real deployments resolve collisions in the value-log layer.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use vellum_index::{MemHistoryLog, VersionedIndex};
use vellum_types::{key_id, u64_to_key, Height, Position};

use crate::ads::AuthenticatedStore;

struct LogRecord {
    key: Vec<u8>,
    value: Vec<u8>,
}

enum StagedOp {
    Set(Position),
    Delete,
}

#[derive(Default)]
struct Staged {
    writing: bool,
    height: Height,
    ops: Vec<(u64, StagedOp)>,
}

/// In-memory [`AuthenticatedStore`] over a value log and versioned index.
pub struct MemAuthStore {
    log: RwLock<Vec<LogRecord>>,
    index: VersionedIndex<MemHistoryLog>,
    staged: Mutex<Staged>,
    closed: AtomicBool,
}

impl Default for MemAuthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemAuthStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            log: RwLock::new(Vec::new()),
            index: VersionedIndex::new(Some(MemHistoryLog::new())),
            staged: Mutex::new(Staged::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Discard history at or below `height`; later `get_at_height` calls
    /// for that range report not-found.
    pub fn prune_below(&self, height: u64) {
        if let Some(log) = self.index.history_log() {
            log.prune_below(height);
        }
    }

    fn assert_open(&self) {
        assert!(!self.closed.load(Ordering::Acquire), "store accessed after close");
    }

    fn record_at(&self, key: &[u8], position: Position) -> Option<Vec<u8>> {
        let log = self.log.read();
        let record = log.get(usize::try_from(position).ok()?)?;
        if record.key != key {
            return None; // identifier collision shadows the older key
        }
        Some(record.value.clone())
    }
}

impl AuthenticatedStore for MemAuthStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.assert_open();
        let position = self.index.get(&u64_to_key(key_id(key)))?;
        self.record_at(key, position)
    }

    fn get_at_height(&self, key: &[u8], height: u64) -> Option<Vec<u8>> {
        self.assert_open();
        let position = self.index.get_at_height(&u64_to_key(key_id(key)), height)?;
        self.record_at(key, position)
    }

    fn prepare_for_update(&self, _key: &[u8]) {
        // The production store warms the Merkle paths under this key;
        // there is nothing to warm in memory.
    }

    fn prepare_for_deletion(&self, _key: &[u8]) {}

    fn begin_write(&self, height: Height) {
        self.assert_open();
        let mut staged = self.staged.lock();
        assert!(!staged.writing, "begin_write while a write bracket is already open");
        staged.writing = true;
        staged.height = height;
    }

    fn set(&self, key: &[u8], value: &[u8]) {
        let mut staged = self.staged.lock();
        assert!(staged.writing, "set outside a write bracket");
        let position = {
            let mut log = self.log.write();
            log.push(LogRecord { key: key.to_vec(), value: value.to_vec() });
            (log.len() - 1) as Position
        };
        staged.ops.push((key_id(key), StagedOp::Set(position)));
    }

    fn delete(&self, key: &[u8]) {
        let mut staged = self.staged.lock();
        assert!(staged.writing, "delete outside a write bracket");
        staged.ops.push((key_id(key), StagedOp::Delete));
    }

    fn end_write(&self) {
        let mut staged = self.staged.lock();
        assert!(staged.writing, "end_write without begin_write");
        let ops = std::mem::take(&mut staged.ops);
        {
            let mut writer = self.index.begin_write(staged.height);
            for (id, op) in &ops {
                match op {
                    StagedOp::Set(position) => writer.set(&u64_to_key(*id), *position),
                    StagedOp::Delete => writer.delete(&u64_to_key(*id)),
                }
            }
            writer.end_write();
        }
        if let Some(log) = self.index.history_log() {
            log.commit_batch();
        }
        staged.writing = false;
    }

    fn root_hash(&self) -> Vec<u8> {
        self.assert_open();
        // The index iterator is half-open, so a key whose identifier is
        // exactly u64::MAX falls outside [0, u64::MAX); look it up
        // separately to keep the commitment over every live entry.
        let mut positions: Vec<Position> =
            self.index.iter(&u64_to_key(0), &u64_to_key(u64::MAX)).map(|(_, p)| p).collect();
        if let Some(position) = self.index.get(&u64_to_key(u64::MAX)) {
            positions.push(position);
        }
        let log = self.log.read();
        let mut hasher = Sha256::new();
        for position in positions {
            let record = &log[position as usize];
            hasher.update((record.key.len() as u64).to_be_bytes());
            hasher.update(&record.key);
            hasher.update((record.value.len() as u64).to_be_bytes());
            hasher.update(&record.value);
        }
        hasher.finalize().to_vec()
    }

    fn active_count(&self) -> usize {
        self.index.active_count()
    }

    fn shard_id(&self, key: &[u8]) -> usize {
        vellum_types::shard_of(key)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.log.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(store: &MemAuthStore, height: Height, ops: &[(&str, Option<&str>)]) {
        store.begin_write(height);
        for (key, op) in ops {
            match op {
                Some(value) => store.set(key.as_bytes(), value.as_bytes()),
                None => store.delete(key.as_bytes()),
            }
        }
        store.end_write();
    }

    #[test]
    fn test_set_and_get() {
        let store = MemAuthStore::new();
        commit(&store, 1, &[("alpha", Some("1")), ("beta", Some("2"))]);

        assert_eq!(store.get(b"alpha"), Some(b"1".to_vec()));
        assert_eq!(store.get(b"beta"), Some(b"2".to_vec()));
        assert_eq!(store.get(b"gamma"), None);
        assert_eq!(store.active_count(), 2);
    }

    #[test]
    fn test_get_at_height_resolves_history() {
        let store = MemAuthStore::new();
        commit(&store, 1, &[("alpha", Some("1"))]);
        commit(&store, 2, &[("alpha", Some("2"))]);

        assert_eq!(store.get_at_height(b"alpha", 1), Some(b"1".to_vec()));
        assert_eq!(store.get_at_height(b"alpha", 2), Some(b"2".to_vec()));
        assert_eq!(store.get_at_height(b"alpha", 0), None);
        assert_eq!(store.get(b"alpha"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_delete_preserves_history_below() {
        let store = MemAuthStore::new();
        commit(&store, 4, &[("alpha", Some("1"))]);
        commit(&store, 5, &[("alpha", None)]);

        assert_eq!(store.get(b"alpha"), None);
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.get_at_height(b"alpha", 4), Some(b"1".to_vec()));
        assert_eq!(store.get_at_height(b"alpha", 5), None);
    }

    #[test]
    fn test_prune_hides_old_heights() {
        let store = MemAuthStore::new();
        commit(&store, 1, &[("alpha", Some("1"))]);
        commit(&store, 2, &[("alpha", Some("2"))]);
        commit(&store, 3, &[("alpha", Some("3"))]);

        store.prune_below(2);
        assert_eq!(store.get_at_height(b"alpha", 1), None);
        assert_eq!(store.get_at_height(b"alpha", 2), None);
        assert_eq!(store.get_at_height(b"alpha", 3), Some(b"3".to_vec()));
    }

    #[test]
    fn test_root_hash_is_state_deterministic() {
        let a = MemAuthStore::new();
        let b = MemAuthStore::new();
        // Same final state via different write orders.
        commit(&a, 1, &[("x", Some("1")), ("y", Some("2"))]);
        commit(&b, 1, &[("y", Some("2"))]);
        commit(&b, 2, &[("x", Some("1"))]);

        assert_eq!(a.root_hash(), b.root_hash());

        commit(&a, 2, &[("x", None)]);
        assert_ne!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn test_last_write_in_block_wins() {
        let store = MemAuthStore::new();
        commit(&store, 1, &[("alpha", Some("1")), ("alpha", Some("2"))]);
        assert_eq!(store.get(b"alpha"), Some(b"2".to_vec()));
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_shard_id_is_stable() {
        let store = MemAuthStore::new();
        assert_eq!(store.shard_id(b"alpha"), store.shard_id(b"alpha"));
        assert!(store.shard_id(b"alpha") < vellum_types::SHARD_COUNT);
    }

    #[test]
    #[should_panic(expected = "outside a write bracket")]
    fn test_set_outside_bracket_is_fatal() {
        let store = MemAuthStore::new();
        store.set(b"alpha", b"1");
    }

    #[test]
    #[should_panic(expected = "nonexistent key")]
    fn test_delete_of_absent_key_is_fatal() {
        let store = MemAuthStore::new();
        commit(&store, 1, &[("alpha", None)]);
    }

    #[test]
    #[should_panic(expected = "after close")]
    fn test_access_after_close_is_fatal() {
        let store = MemAuthStore::new();
        store.close();
        let _ = store.get(b"alpha");
    }
}
