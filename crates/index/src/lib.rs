//! vellum-index: the versioned key→position index.
//!
//! The index maintains, for a universe of 64-bit keys, two views of the
//! same data:
//!
//! - An in-memory ordered map holding only the latest `key → position`
//!   record for every live key. All latest-state queries are answered here
//!   in O(log n) without touching disk.
//! - An ordered history log (the [`HistoryLog`] collaborator) holding one
//!   entry per `(key, block height)` write or delete, so the position of
//!   any key as of any unpruned height is a single reverse seek away.
//!
//! History entries live under the composite key
//! `0x00 ‖ key ‖ big-endian height`. The leading zero byte reserves a
//! namespace inside a log that may be shared with other writers; the
//! big-endian height makes a reverse scan from `(key, h+1)` land exactly on
//! the most recent entry at or before `h`.
//!
//! ## Write discipline
//!
//! Writes happen only inside a block's write bracket:
//!
//! ```
//! use vellum_index::{MemHistoryLog, VersionedIndex};
//!
//! let index = VersionedIndex::new(Some(MemHistoryLog::new()));
//! let mut writer = index.begin_write(1);
//! writer.set(&7u64.to_be_bytes(), 100);
//! writer.end_write();
//! assert_eq!(index.get(&7u64.to_be_bytes()), Some(100));
//! ```
//!
//! The bracket holds the index's exclusive lock for its lifetime; readers
//! and iterators take the shared lock. Contract violations (writing outside
//! a bracket, deleting an absent key, reading mid-bracket) panic: they
//! encode host bugs, and masking them risks silent state corruption.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod history;
mod tree;

pub use history::{
    HISTORY_PREFIX, HistoryLog, MemHistoryLog, history_key, split_history_key,
};
pub use tree::{IndexError, IndexWriter, RangeIter, VersionedIndex};
