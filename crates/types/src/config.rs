//! Tuning configuration for the store layers.
//!
//! Defaults come from the engine-wide constants in the crate root. Hosts
//! that override them must call [`StoreConfig::validate`] before handing
//! the config to a store; the stores themselves assume a valid config.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::{EVICT_TRY_DIST, MAX_KEY_LENGTH, ROOT_CACHE_SIZE_LIMIT};

/// Errors produced by [`StoreConfig::validate`].
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The eviction sample size must be at least 1.
    #[snafu(display("evict_try_dist must be at least 1"))]
    ZeroEvictTryDist,

    /// The cache size limit must be at least 1.
    #[snafu(display("cache_size_limit must be at least 1"))]
    ZeroCacheSizeLimit,

    /// The key length cap cannot exceed the engine-wide maximum.
    #[snafu(display("max_key_length {got} exceeds the engine maximum {max}"))]
    KeyLengthTooLarge {
        /// The configured value.
        got: usize,
        /// The engine-wide maximum.
        max: usize,
    },
}

/// Tuning knobs for the root store and its cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Per-shard entry limit for the root store cache; a shard never
    /// holds more than this many entries. Inserting into a full shard
    /// evicts the oldest sampled entry first.
    pub cache_size_limit: usize,
    /// Number of entries sampled when picking an eviction victim.
    pub evict_try_dist: usize,
    /// Maximum accepted key length on the write path.
    pub max_key_length: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_size_limit: ROOT_CACHE_SIZE_LIMIT,
            evict_try_dist: EVICT_TRY_DIST,
            max_key_length: MAX_KEY_LENGTH,
        }
    }
}

impl StoreConfig {
    /// Check the configured values for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.evict_try_dist == 0 {
            return Err(ConfigError::ZeroEvictTryDist);
        }
        if self.cache_size_limit == 0 {
            return Err(ConfigError::ZeroCacheSizeLimit);
        }
        if self.max_key_length > MAX_KEY_LENGTH {
            return Err(ConfigError::KeyLengthTooLarge {
                got: self.max_key_length,
                max: MAX_KEY_LENGTH,
            });
        }
        Ok(())
    }
}
