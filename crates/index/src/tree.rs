//! The versioned index: an in-memory ordered map over a history log.
//!
//! The in-memory map holds only the latest key→position record; the
//! history log keeps every `(key, height)` version. Boot-time `init`
//! replays the log in reverse to rebuild the map, taking the most recent
//! entry per key and skipping keys whose most recent entry is a delete.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use snafu::Snafu;

use vellum_types::{key_to_u64, u64_to_key, Height, Position, UNSET_HEIGHT};

use crate::history::{history_key, HistoryLog, HISTORY_PREFIX};

/// Corruption detected while replaying the history log.
///
/// Any of these means the log contains entries outside the index's
/// contract; the host must treat the store as damaged rather than continue
/// on a partial replay.
#[derive(Debug, Snafu)]
pub enum IndexError {
    /// A history entry's key does not start with the reserved zero byte.
    #[snafu(display("history entry outside the reserved namespace: leading byte {byte:#04x}"))]
    NamespaceByte {
        /// The offending leading byte.
        byte: u8,
    },

    /// A history entry's key is too short to hold a logical key and a
    /// height suffix.
    #[snafu(display("history key too short: {len} bytes"))]
    KeyTooShort {
        /// Total length of the raw composite key.
        len: usize,
    },

    /// A history entry's value is neither a position nor a delete marker.
    #[snafu(display("history value length {len} is neither 0 nor 8"))]
    ValueLength {
        /// Length of the value.
        len: usize,
    },
}

struct Inner {
    map: BTreeMap<u64, Position>,
    /// Height carried into history entries written by the open bracket.
    curr_height: u64,
    /// Height of the most recent bracket; enforces the strictly-increasing
    /// epoch contract.
    last_height: Height,
}

/// Versioned index over 64-bit keys.
///
/// Readers take the shared lock (held for the whole lifetime of an
/// iterator); a block's write bracket takes the exclusive lock via
/// [`begin_write`](Self::begin_write). The `is_writing` flag is kept in
/// addition to the lock: it turns protocol misuse that the lock alone
/// would deadlock on into an immediate panic.
pub struct VersionedIndex<L: HistoryLog> {
    inner: RwLock<Inner>,
    log: Option<L>,
    is_writing: AtomicBool,
    during_init: AtomicBool,
}

impl<L: HistoryLog> VersionedIndex<L> {
    /// Create an index over `log`. `None` detaches history entirely: the
    /// index then answers only latest-state queries.
    pub fn new(log: Option<L>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: BTreeMap::new(),
                curr_height: 0,
                last_height: UNSET_HEIGHT,
            }),
            log,
            is_writing: AtomicBool::new(false),
            during_init: AtomicBool::new(false),
        }
    }

    /// Rebuild the in-memory map from the history log.
    ///
    /// Scans the log newest-first; the first entry seen for each logical
    /// key is its most recent version. A write inserts the key, a delete
    /// skips it. `progress` is invoked once per distinct logical key.
    ///
    /// # Errors
    ///
    /// Returns an [`IndexError`] on the first malformed entry. A malformed
    /// log is corrupt; replay must not continue past it.
    pub fn init(&self, mut progress: impl FnMut(&[u8])) -> Result<(), IndexError> {
        let Some(log) = &self.log else { return Ok(()) };
        let mut inner = self.inner.write();
        let mut entries = 0usize;
        let mut current: Option<Vec<u8>> = None;

        for (raw, value) in log.reverse_range(&[], None) {
            entries += 1;
            let byte = *raw.first().ok_or(IndexError::KeyTooShort { len: 0 })?;
            if byte != HISTORY_PREFIX {
                return Err(IndexError::NamespaceByte { byte });
            }
            // namespace byte + 64-bit logical key + 8 height bytes
            if raw.len() < 1 + 8 + 8 {
                return Err(IndexError::KeyTooShort { len: raw.len() });
            }
            if value.len() != 8 && !value.is_empty() {
                return Err(IndexError::ValueLength { len: value.len() });
            }

            let logical = &raw[1..raw.len() - 8];
            if current.as_deref() == Some(logical) {
                continue; // older version of a key already decided
            }
            current = Some(logical.to_vec());
            progress(logical);
            if !value.is_empty() {
                let position = u64::from_be_bytes(
                    value.as_slice().try_into().expect("length checked above"),
                ) as Position;
                inner.map.insert(key_to_u64(logical), position);
            }
        }

        tracing::info!(entries, live = inner.map.len(), "history replay complete");
        Ok(())
    }

    /// Suppress history writes while the host bulk-loads state.
    pub fn set_during_init(&self, flag: bool) {
        self.during_init.store(flag, Ordering::Relaxed);
    }

    /// Number of live keys.
    pub fn active_count(&self) -> usize {
        self.inner.read().map.len()
    }

    /// Open the write bracket for block `height`.
    ///
    /// Blocks until all outstanding readers release the shared lock, then
    /// holds the exclusive lock until the returned writer is dropped or
    /// [`IndexWriter::end_write`] is called.
    ///
    /// # Panics
    ///
    /// Panics if a bracket is already open, or if `height` does not
    /// strictly increase over the previous bracket.
    pub fn begin_write(&self, height: Height) -> IndexWriter<'_, L> {
        let mut inner = self.inner.write();
        assert!(
            !self.is_writing.load(Ordering::Acquire),
            "begin_write while a write bracket is already open"
        );
        assert!(
            height > inner.last_height,
            "write heights must strictly increase: got {height} after {}",
            inner.last_height
        );
        inner.curr_height = height as u64;
        inner.last_height = height;
        self.is_writing.store(true, Ordering::Release);
        IndexWriter { index: self, inner }
    }

    /// Latest position of `key`, if live.
    ///
    /// # Panics
    ///
    /// Panics when called during an open write bracket.
    pub fn get(&self, key: &[u8]) -> Option<Position> {
        assert!(
            !self.is_writing.load(Ordering::Acquire),
            "get during an open write bracket"
        );
        let inner = self.inner.read();
        inner.map.get(&key_to_u64(key)).copied()
    }

    /// Position of `key` as of block `height`, resolved through the
    /// history log.
    ///
    /// Returns `None` when the key did not exist at that height, was
    /// deleted by then, or the height lies at or below the prune horizon.
    pub fn get_at_height(&self, key: &[u8], height: u64) -> Option<Position> {
        let log = self.log.as_ref()?;
        if let Some(pruned) = log.prune_height() {
            if height <= pruned {
                return None;
            }
        }
        let seek = history_key(key, height.saturating_add(1));
        let (raw, value) = log.reverse_range(&[], Some(&seek)).next()?;
        // The scan may land on a different key's history; the entry counts
        // only if its logical-key slice matches exactly.
        if raw.len() != 1 + key.len() + 8 || &raw[1..1 + key.len()] != key {
            return None;
        }
        if value.is_empty() {
            return None; // deleted as of this height
        }
        let bytes: [u8; 8] = value.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes) as Position)
    }

    /// Snapshot forward iterator over the live keys in `[start, end)`.
    ///
    /// The iterator holds the shared lock for its lifetime; drop it to
    /// release. An empty or inverted range yields an immediately exhausted
    /// iterator.
    pub fn iter(&self, start: &[u8], end: &[u8]) -> RangeIter<'_> {
        self.range_iter(start, end, false)
    }

    /// Snapshot reverse iterator over the live keys in `[start, end)`.
    pub fn iter_rev(&self, start: &[u8], end: &[u8]) -> RangeIter<'_> {
        self.range_iter(start, end, true)
    }

    fn range_iter(&self, start: &[u8], end: &[u8], reverse: bool) -> RangeIter<'_> {
        assert!(
            !self.is_writing.load(Ordering::Acquire),
            "iterator opened during an open write bracket"
        );
        let inner = self.inner.read();
        let start = key_to_u64(start);
        let end = key_to_u64(end);
        let cursor = if start >= end { Cursor::Exhausted } else { Cursor::Unstarted };
        RangeIter { inner, is_writing: &self.is_writing, start, end, cursor, reverse }
    }

    /// Borrow the attached history log, if any.
    pub fn history_log(&self) -> Option<&L> {
        self.log.as_ref()
    }
}

/// Exclusive write bracket over a [`VersionedIndex`].
///
/// Created by [`VersionedIndex::begin_write`]; all mutations of a block
/// flow through it. Dropping the writer (or calling
/// [`end_write`](Self::end_write)) closes the bracket.
pub struct IndexWriter<'a, L: HistoryLog> {
    index: &'a VersionedIndex<L>,
    inner: RwLockWriteGuard<'a, Inner>,
}

impl<L: HistoryLog> IndexWriter<'_, L> {
    /// Record `key → position` and append the height-tagged history entry.
    pub fn set(&mut self, key: &[u8], position: Position) {
        self.inner.map.insert(key_to_u64(key), position);
        self.append_history(key, Some(position));
    }

    /// Remove `key` and append a delete marker to history.
    ///
    /// # Panics
    ///
    /// Panics if the key is not live: deleting an absent key means the
    /// host's view of the state has diverged from the index.
    pub fn delete(&mut self, key: &[u8]) {
        let id = key_to_u64(key);
        if self.inner.map.remove(&id).is_none() {
            panic!("deleting a nonexistent key: {id:#018x}");
        }
        self.append_history(key, None);
    }

    /// Height this bracket was opened at.
    pub fn height(&self) -> Height {
        self.inner.last_height
    }

    /// Close the bracket, releasing the exclusive lock.
    pub fn end_write(self) {}

    fn append_history(&self, key: &[u8], position: Option<Position>) {
        if self.index.during_init.load(Ordering::Relaxed) {
            return;
        }
        let Some(log) = &self.index.log else { return };
        let value = match position {
            Some(p) => (p as u64).to_be_bytes().to_vec(),
            None => Vec::new(),
        };
        log.batch_set(history_key(key, self.inner.curr_height), value);
    }
}

impl<L: HistoryLog> Drop for IndexWriter<'_, L> {
    fn drop(&mut self) {
        self.index.is_writing.store(false, Ordering::Release);
    }
}

enum Cursor {
    Unstarted,
    After(u64),
    Exhausted,
}

/// Snapshot iterator over a half-open 64-bit key range.
///
/// Holds the index's shared lock until dropped. Each step re-seeks from
/// the last yielded key, so the iterator stays valid without borrowing
/// into the map.
pub struct RangeIter<'a> {
    inner: RwLockReadGuard<'a, Inner>,
    is_writing: &'a AtomicBool,
    start: u64,
    end: u64,
    cursor: Cursor,
    reverse: bool,
}

impl RangeIter<'_> {
    /// The literal `[start, end)` bounds this iterator was opened with,
    /// as big-endian key buffers.
    pub fn domain(&self) -> ([u8; 8], [u8; 8]) {
        (u64_to_key(self.start), u64_to_key(self.end))
    }
}

impl Iterator for RangeIter<'_> {
    type Item = (u64, Position);

    fn next(&mut self) -> Option<Self::Item> {
        // Cannot fire while we hold the shared lock; it catches brackets
        // opened through a leaked or force-dropped guard.
        assert!(
            !self.is_writing.load(Ordering::Acquire),
            "iterator advanced during an open write bracket"
        );
        let found = match (&self.cursor, self.reverse) {
            (Cursor::Exhausted, _) => None,
            (Cursor::Unstarted, false) => self.inner.map.range(self.start..self.end).next(),
            (Cursor::Unstarted, true) => self.inner.map.range(self.start..self.end).next_back(),
            (Cursor::After(k), false) => self
                .inner
                .map
                .range((Bound::Excluded(*k), Bound::Excluded(self.end)))
                .next(),
            (Cursor::After(k), true) => self
                .inner
                .map
                .range((Bound::Included(self.start), Bound::Excluded(*k)))
                .next_back(),
        };
        match found {
            Some((&key, &position)) => {
                self.cursor = Cursor::After(key);
                Some((key, position))
            }
            None => {
                self.cursor = Cursor::Exhausted;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use vellum_types::u64_to_key;

    use super::*;
    use crate::history::MemHistoryLog;

    fn key(id: u64) -> [u8; 8] {
        u64_to_key(id)
    }

    fn with_log() -> VersionedIndex<MemHistoryLog> {
        VersionedIndex::new(Some(MemHistoryLog::new()))
    }

    /// Run one block: open the bracket, apply `ops`, close, commit history.
    fn block(index: &VersionedIndex<MemHistoryLog>, height: Height, ops: &[(u64, Option<Position>)]) {
        let mut writer = index.begin_write(height);
        for &(id, op) in ops {
            match op {
                Some(position) => writer.set(&key(id), position),
                None => writer.delete(&key(id)),
            }
        }
        writer.end_write();
        index.history_log().unwrap().commit_batch();
    }

    #[test]
    fn test_empty_index() {
        let index = with_log();
        index.init(|_| {}).expect("empty log replays");
        assert_eq!(index.active_count(), 0);
        assert_eq!(index.get(&key(1)), None);
        assert_eq!(index.get_at_height(&key(1), 10), None);
    }

    #[test]
    fn test_set_then_get_across_heights() {
        let index = with_log();
        block(&index, 1, &[(1, Some(100))]);
        assert_eq!(index.get(&key(1)), Some(100));

        block(&index, 2, &[(1, Some(200))]);
        assert_eq!(index.get(&key(1)), Some(200));
        assert_eq!(index.get_at_height(&key(1), 1), Some(100));
        assert_eq!(index.get_at_height(&key(1), 2), Some(200));
        assert_eq!(index.get_at_height(&key(1), 99), Some(200));
        assert_eq!(index.get_at_height(&key(1), 0), None);
    }

    #[test]
    fn test_unchanged_key_reads_the_same_at_later_heights() {
        let index = with_log();
        block(&index, 3, &[(7, Some(70))]);
        block(&index, 8, &[(9, Some(90))]); // unrelated write
        for h in 3..=10 {
            assert_eq!(index.get_at_height(&key(7), h), Some(70));
        }
    }

    #[test]
    fn test_delete_semantics() {
        let index = with_log();
        block(&index, 4, &[(5, Some(55))]);
        block(&index, 5, &[(5, None)]);

        assert_eq!(index.get(&key(5)), None);
        assert_eq!(index.active_count(), 0);
        assert_eq!(index.get_at_height(&key(5), 4), Some(55));
        assert_eq!(index.get_at_height(&key(5), 5), None);
        assert_eq!(index.get_at_height(&key(5), 6), None);
    }

    #[test]
    fn test_forward_iteration_order() {
        let index = with_log();
        block(&index, 1, &[(1, Some(10)), (5, Some(50)), (3, Some(30))]);

        let items: Vec<_> = index.iter(&key(0), &key(u64::MAX)).collect();
        assert_eq!(items, vec![(1, 10), (3, 30), (5, 50)]);
    }

    #[test]
    fn test_reverse_iteration_order() {
        let index = with_log();
        block(&index, 1, &[(1, Some(10)), (5, Some(50)), (3, Some(30))]);

        let items: Vec<_> = index.iter_rev(&key(0), &key(u64::MAX)).collect();
        assert_eq!(items, vec![(5, 50), (3, 30), (1, 10)]);
    }

    #[test]
    fn test_iteration_respects_half_open_bounds() {
        let index = with_log();
        block(&index, 1, &[(1, Some(10)), (3, Some(30)), (5, Some(50))]);

        let items: Vec<_> = index.iter(&key(1), &key(5)).collect();
        assert_eq!(items, vec![(1, 10), (3, 30)]);

        let items: Vec<_> = index.iter_rev(&key(2), &key(6)).collect();
        assert_eq!(items, vec![(5, 50), (3, 30)]);
    }

    #[test]
    fn test_inverted_range_is_exhausted() {
        let index = with_log();
        block(&index, 1, &[(3, Some(30))]);
        assert_eq!(index.iter(&key(5), &key(1)).count(), 0);
        assert_eq!(index.iter_rev(&key(5), &key(5)).count(), 0);
    }

    #[test]
    fn test_iterator_domain_reports_literal_bounds() {
        let index = with_log();
        let iter = index.iter(&key(2), &key(9));
        assert_eq!(iter.domain(), (key(2), key(9)));
    }

    #[test]
    fn test_pruned_history_reads_not_found() {
        let index = with_log();
        block(&index, 1, &[(1, Some(10))]);
        block(&index, 2, &[(1, Some(20))]);
        block(&index, 3, &[(1, Some(30))]);

        index.history_log().unwrap().prune_below(2);
        assert_eq!(index.get_at_height(&key(1), 1), None);
        assert_eq!(index.get_at_height(&key(1), 2), None);
        assert_eq!(index.get_at_height(&key(1), 3), Some(30));
        // The latest view is unaffected by pruning.
        assert_eq!(index.get(&key(1)), Some(30));
    }

    #[test]
    fn test_replay_rebuilds_latest_state() {
        let populated = with_log();
        block(&populated, 1, &[(1, Some(10)), (2, Some(20)), (3, Some(30))]);
        block(&populated, 2, &[(2, Some(21)), (3, None)]);

        // A fresh index over the same entries must converge to the same map.
        let mut seen = Vec::new();
        let fresh = VersionedIndex::new(Some(clone_log(populated.history_log().unwrap())));
        fresh.init(|k| seen.push(k.to_vec())).expect("replay");

        assert_eq!(fresh.active_count(), 2);
        assert_eq!(fresh.get(&key(1)), Some(10));
        assert_eq!(fresh.get(&key(2)), Some(21));
        assert_eq!(fresh.get(&key(3)), None); // most recent entry was a delete
        assert_eq!(seen.len(), 3); // one progress report per distinct key
    }

    /// Copy a log's committed entries into a fresh one.
    fn clone_log(log: &MemHistoryLog) -> MemHistoryLog {
        let copy = MemHistoryLog::new();
        for (k, v) in log.reverse_range(&[], None) {
            copy.batch_set(k, v);
        }
        copy.commit_batch();
        copy
    }

    #[test]
    fn test_replay_rejects_foreign_namespace() {
        let log = MemHistoryLog::new();
        log.batch_set(vec![0x01; 20], vec![0; 8]);
        log.commit_batch();

        let index = VersionedIndex::new(Some(log));
        let err = index.init(|_| {}).expect_err("corrupt log must fail replay");
        assert!(matches!(err, IndexError::NamespaceByte { byte: 0x01 }));
    }

    #[test]
    fn test_replay_rejects_short_keys() {
        let log = MemHistoryLog::new();
        log.batch_set(history_key(b"abc", 1), vec![0; 8]); // 3-byte logical key
        log.commit_batch();

        let index = VersionedIndex::new(Some(log));
        assert!(matches!(
            index.init(|_| {}).expect_err("short key"),
            IndexError::KeyTooShort { .. }
        ));
    }

    #[test]
    fn test_replay_rejects_bad_value_length() {
        let log = MemHistoryLog::new();
        log.batch_set(history_key(b"kkkkkkkk", 1), vec![0; 4]);
        log.commit_batch();

        let index = VersionedIndex::new(Some(log));
        assert!(matches!(
            index.init(|_| {}).expect_err("bad value"),
            IndexError::ValueLength { len: 4 }
        ));
    }

    #[test]
    fn test_during_init_suppresses_history() {
        let index = with_log();
        index.set_during_init(true);
        block(&index, 1, &[(1, Some(10))]);
        assert_eq!(index.history_log().unwrap().entry_count(), 0);

        index.set_during_init(false);
        block(&index, 2, &[(1, Some(11))]);
        assert_eq!(index.history_log().unwrap().entry_count(), 1);
    }

    #[test]
    fn test_detached_index_answers_latest_only() {
        let index: VersionedIndex<MemHistoryLog> = VersionedIndex::new(None);
        let mut writer = index.begin_write(1);
        writer.set(&key(1), 10);
        writer.end_write();

        assert_eq!(index.get(&key(1)), Some(10));
        assert_eq!(index.get_at_height(&key(1), 1), None);
    }

    #[test]
    #[should_panic(expected = "nonexistent key")]
    fn test_delete_of_absent_key_is_fatal() {
        let index = with_log();
        let mut writer = index.begin_write(1);
        writer.delete(&key(42));
    }

    #[test]
    #[should_panic(expected = "strictly increase")]
    fn test_non_increasing_heights_are_fatal() {
        let index = with_log();
        block(&index, 5, &[(1, Some(10))]);
        let _writer = index.begin_write(5);
    }

    #[test]
    #[should_panic(expected = "write bracket")]
    fn test_get_during_write_bracket_is_fatal() {
        let index = with_log();
        let _writer = index.begin_write(1);
        let _ = index.get(&key(1));
    }

    #[test]
    fn test_writer_drop_closes_the_bracket() {
        let index = with_log();
        {
            let mut writer = index.begin_write(1);
            writer.set(&key(1), 10);
            // dropped without end_write
        }
        assert_eq!(index.get(&key(1)), Some(10));
    }

    mod proptest_model {
        use std::collections::BTreeMap as Model;

        use proptest::prelude::*;

        use super::*;

        /// A block is a list of (key id, operation) pairs; `None` asks for
        /// a delete, which is applied only when the key is live.
        fn arb_blocks() -> impl Strategy<Value = Vec<Vec<(u64, Option<Position>)>>> {
            let op = (0u64..24, prop_oneof![
                3 => (0i64..1_000_000).prop_map(Some),
                1 => Just(None),
            ]);
            proptest::collection::vec(proptest::collection::vec(op, 0..8), 1..12)
        }

        proptest! {
            /// The index must agree with a plain ordered-map model on
            /// latest state, iteration, and every historical height.
            #[test]
            fn index_matches_model(blocks in arb_blocks()) {
                let index = with_log();
                let mut model: Model<u64, Position> = Model::new();
                let mut snapshots: Vec<(u64, Model<u64, Position>)> = Vec::new();

                for (i, ops) in blocks.iter().enumerate() {
                    let height = (i + 1) as Height;
                    let mut writer = index.begin_write(height);
                    for &(id, op) in ops {
                        match op {
                            Some(position) => {
                                writer.set(&key(id), position);
                                model.insert(id, position);
                            }
                            None => {
                                if model.remove(&id).is_some() {
                                    writer.delete(&key(id));
                                }
                            }
                        }
                    }
                    writer.end_write();
                    index.history_log().unwrap().commit_batch();
                    snapshots.push((height as u64, model.clone()));
                }

                prop_assert_eq!(index.active_count(), model.len());
                for id in 0u64..24 {
                    prop_assert_eq!(index.get(&key(id)), model.get(&id).copied());
                }

                let items: Vec<_> = index.iter(&key(0), &key(u64::MAX)).collect();
                let expected: Vec<_> = model.iter().map(|(&k, &v)| (k, v)).collect();
                prop_assert_eq!(items, expected);

                for (height, snapshot) in &snapshots {
                    for id in 0u64..24 {
                        prop_assert_eq!(
                            index.get_at_height(&key(id), *height),
                            snapshot.get(&id).copied(),
                            "key {} at height {}", id, height
                        );
                    }
                }
            }
        }
    }
}
