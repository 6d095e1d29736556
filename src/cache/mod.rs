//! Response cache for avoiding redundant paid calls
//!
//! The cache is a plain key/value store: it does not know how keys are derived.
//! The router computes a model-agnostic fingerprint (see
//! [`crate::router::fingerprint`]) and uses it as the key.
//!
//! ## Policy
//!
//! 1. **TTL**: every entry carries an expiry; expired entries are never returned
//! 2. **Compression**: values whose serialized size exceeds a threshold are gzipped
//! 3. **Capacity**: entry count and stored bytes are both bounded; the least
//!    recently accessed entry is evicted first
//! 4. **Sweep**: a background task removes expired entries independent of access

mod store;
mod tracker;

pub use store::{spawn_sweeper, EntryMetadata, ResponseCache};
pub use tracker::CacheMetrics;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to serialize cache value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Value of {size} bytes exceeds cache capacity of {max} bytes")]
    TooLarge { size: usize, max: usize },
}

/// Longest lifetime an entry can be given; larger TTLs are clamped
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Capacity and compression limits for the response cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum cumulative size of stored payloads
    pub max_bytes: usize,
    /// Serialized values larger than this are compressed
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 50 * 1024 * 1024,
            compression_threshold: 1024,
        }
    }
}
