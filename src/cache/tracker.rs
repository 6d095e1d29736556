//! Cache counters and the metrics snapshot built from them

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated on every cache operation
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    compressed_writes: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, compressed: bool) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if compressed {
            self.compressed_writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.writes,
            &self.evictions,
            &self.expirations,
            &self.compressed_writes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, entry_count: usize, total_bytes: usize) -> CacheMetrics {
        let cache_hits = self.hits.load(Ordering::Relaxed);
        let cache_misses = self.misses.load(Ordering::Relaxed);
        let total = cache_hits + cache_misses;

        CacheMetrics {
            cache_hits,
            cache_misses,
            cache_writes: self.writes.load(Ordering::Relaxed),
            compressed_writes: self.compressed_writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entry_count,
            total_bytes,
            hit_rate: if total > 0 {
                cache_hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time view of cache performance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Total cache hits
    pub cache_hits: u64,
    /// Total cache misses (including expired lookups)
    pub cache_misses: u64,
    /// Values stored
    pub cache_writes: u64,
    /// Values stored compressed
    pub compressed_writes: u64,
    /// Entries removed to stay under capacity
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Current number of entries
    pub entry_count: usize,
    /// Current stored payload size in bytes
    pub total_bytes: usize,
    /// Cache hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

impl std::fmt::Display for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Cache Metrics ===")?;
        writeln!(f, "Entries: {}", self.entry_count)?;
        writeln!(f, "Stored bytes: {}", self.total_bytes)?;
        writeln!(f, "Cache hits: {}", self.cache_hits)?;
        writeln!(f, "Cache misses: {}", self.cache_misses)?;
        writeln!(f, "Hit rate: {:.1}%", self.hit_rate * 100.0)?;
        writeln!(f, "Writes: {} ({} compressed)", self.cache_writes, self.compressed_writes)?;
        writeln!(f, "Evictions: {}", self.evictions)?;
        writeln!(f, "Expirations: {}", self.expirations)?;
        Ok(())
    }
}
