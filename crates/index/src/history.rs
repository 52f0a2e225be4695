//! History log contract and composite-key encoding.
//!
//! The versioned index persists one history entry per `(key, height)`
//! mutation into an ordered byte-key log. The log itself is a collaborator
//! behind the [`HistoryLog`] trait; [`MemHistoryLog`] is the in-memory
//! reference implementation used by tests and embedded deployments.
//!
//! ## Entry layout
//!
//! ```text
//! key:   0x00 ‖ logical_key ‖ height (8 bytes, big-endian)
//! value: position (8 bytes, big-endian)   -- write
//!        (empty)                          -- delete
//! ```
//!
//! Composite keys sort first by logical key, then by ascending height. The
//! leading zero byte reserves the namespace; callers sharing the log must
//! keep other writers out of that prefix.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

/// Leading byte of every history entry. Reserves the namespace within a
/// shared ordered log.
pub const HISTORY_PREFIX: u8 = 0x00;

/// Encode the composite history key for `key` at `height`.
pub fn history_key(key: &[u8], height: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + key.len() + 8);
    buf.push(HISTORY_PREFIX);
    buf.extend_from_slice(key);
    buf.extend_from_slice(&height.to_be_bytes());
    buf
}

/// Split a raw history key into its logical key and height.
///
/// Returns `None` when the buffer is too short to contain the namespace
/// byte and the 8 height bytes.
pub fn split_history_key(raw: &[u8]) -> Option<(&[u8], u64)> {
    if raw.len() < 1 + 8 {
        return None;
    }
    let (logical, height_bytes) = raw[1..].split_at(raw.len() - 1 - 8);
    let height = u64::from_be_bytes(height_bytes.try_into().ok()?);
    Some((logical, height))
}

/// Ordered key-value log holding the index's history entries.
///
/// The contract mirrors what any ordered persistence layer with
/// prefix-range iteration can provide: reverse range scans over committed
/// entries, appends into a pending batch guarded by the log's own lock,
/// and the prune horizon below which history may have been discarded.
pub trait HistoryLog: Send + Sync {
    /// Iterate committed entries in `[start, end)` from highest key to
    /// lowest. `end = None` means unbounded above.
    fn reverse_range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>;

    /// Append an entry to the pending batch. The batch is guarded by the
    /// log's own mutex, independent of the index lock, so sharded index
    /// writers can append concurrently.
    fn batch_set(&self, key: Vec<u8>, value: Vec<u8>);

    /// The prune horizon, if pruning is enabled: queries at or below this
    /// height must report not-found.
    fn prune_height(&self) -> Option<u64>;
}

/// In-memory [`HistoryLog`] backed by an ordered map.
///
/// Batched appends become visible to readers only after
/// [`commit_batch`](Self::commit_batch), matching the per-block commit
/// cadence of a durable log.
#[derive(Default)]
pub struct MemHistoryLog {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    batch: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    prune_height: RwLock<Option<u64>>,
}

impl MemHistoryLog {
    /// Create an empty log with pruning disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the pending batch to the committed entries.
    pub fn commit_batch(&self) {
        let batch = std::mem::take(&mut *self.batch.lock());
        if batch.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        for (key, value) in batch {
            entries.insert(key, value);
        }
    }

    /// Number of committed entries.
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Number of entries waiting in the pending batch.
    pub fn pending_count(&self) -> usize {
        self.batch.lock().len()
    }

    /// Enable pruning: drop committed entries at or below `height` and
    /// record the horizon reported by [`HistoryLog::prune_height`].
    pub fn prune_below(&self, height: u64) {
        let mut entries = self.entries.write();
        entries.retain(|raw, _| match split_history_key(raw) {
            Some((_, h)) => h > height,
            None => true,
        });
        *self.prune_height.write() = Some(height);
    }
}

impl HistoryLog for MemHistoryLog {
    fn reverse_range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        Box::new(RevIter {
            entries: self.entries.read(),
            start: start.to_vec(),
            upper: end.map(<[u8]>::to_vec),
        })
    }

    fn batch_set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.batch.lock().push((key, value));
    }

    fn prune_height(&self) -> Option<u64> {
        *self.prune_height.read()
    }
}

/// Reverse cursor over the committed entries.
///
/// Holds the read guard for its lifetime and re-seeks on every step, so no
/// borrow into the map outlives a single `next` call.
struct RevIter<'a> {
    entries: RwLockReadGuard<'a, BTreeMap<Vec<u8>, Vec<u8>>>,
    start: Vec<u8>,
    /// Exclusive upper bound for the next step; `None` means unbounded.
    /// Every yielded key becomes the bound for the step after it, so the
    /// cursor only ever moves downward.
    upper: Option<Vec<u8>>,
}

impl Iterator for RevIter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let lower = Bound::Included(self.start.as_slice());
        let upper = match &self.upper {
            Some(k) => Bound::Excluded(k.as_slice()),
            None => Bound::Unbounded,
        };
        let (key, value) = {
            let (k, v) = self.entries.range::<[u8], _>((lower, upper)).next_back()?;
            (k.clone(), v.clone())
        };
        self.upper = Some(key.clone());
        Some((key, value))
    }
}
