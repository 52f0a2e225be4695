//! Core primitives shared across the Vellum state store.
//!
//! Vellum records blockchain state as discrete write epochs (block heights)
//! over an append-only value log. This crate provides the foundational
//! vocabulary used by every layer:
//!
//! - [`Height`] and [`Position`]: block heights and value-log offsets
//! - 64-bit key identifiers and their big-endian codec
//! - Shard assignment for the root store's partitioned cache
//! - Engine-wide tuning constants and the validated [`StoreConfig`]

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;

pub use config::{ConfigError, StoreConfig};

/// Block height: a monotonically increasing integer identifying an atomic
/// write epoch. Signed so the unset sentinel can be represented.
pub type Height = i64;

/// Sentinel height meaning "no height has been set yet".
///
/// Stores start at this value; writing before a real height is recorded is
/// a contract violation.
pub const UNSET_HEIGHT: Height = -1;

/// Offset of a record in the external value log.
///
/// Non-negative for live records. A position of `0` paired with an empty
/// history value encodes a deletion.
pub type Position = i64;

/// Number of cache shards in the root store.
///
/// Shared across the engine: the authenticated data store's shard function
/// must produce indices in `[0, SHARD_COUNT)`.
pub const SHARD_COUNT: usize = 16;

/// Maximum accepted key length, in bytes, at any layer.
pub const MAX_KEY_LENGTH: usize = 8192;

/// Retention hint: the number of recent blocks whose history is expected to
/// stay on the hot path (unpruned and cheap to query).
pub const RECENT_BLOCK_COUNT: u64 = 128;

/// Soft per-shard entry limit for the root store cache.
pub const ROOT_CACHE_SIZE_LIMIT: usize = 1024 * 1024;

/// Number of cache entries sampled when picking an eviction victim.
///
/// Bounds the eviction cost to O(1): the insert path scans at most this
/// many entries of the full shard and evicts the oldest one seen.
pub const EVICT_TRY_DIST: usize = 16;

/// Default segment size of the external value log, in bytes.
pub const DEFAULT_VALUE_LOG_SEGMENT_SIZE: usize = 1024 * 1024 * 1024;

/// Live-entry count above which the value log starts considering
/// compaction of stale records.
pub const START_REAP_THRESHOLD: i64 = 1_000_000;

/// Decode a 64-bit key identifier from the first 8 bytes of `key`.
///
/// # Panics
///
/// Panics if `key` is shorter than 8 bytes. Callers are required to pass
/// 8-byte big-endian buffers; anything shorter is a contract violation.
#[inline]
pub fn key_to_u64(key: &[u8]) -> u64 {
    assert!(key.len() >= 8, "key must be at least 8 bytes, got {}", key.len());
    let head: [u8; 8] = key[..8].try_into().expect("length checked above");
    u64::from_be_bytes(head)
}

/// Encode a 64-bit key identifier as an 8-byte big-endian buffer.
#[inline]
pub fn u64_to_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Derive a 64-bit key identifier from an arbitrary logical key.
///
/// Uses seahash: distribution is what matters here, not cryptographic
/// strength. Collision handling is the caller's concern.
#[inline]
pub fn key_id(key: &[u8]) -> u64 {
    seahash::hash(key)
}

/// Default shard assignment: the top nibble of the key's first byte.
///
/// Authenticated data stores may supply their own shard function, but the
/// root store must use the same one to keep cache locality aligned.
#[inline]
pub fn shard_of(key: &[u8]) -> usize {
    match key.first() {
        Some(&b) => (b >> 4) as usize,
        None => 0,
    }
}
