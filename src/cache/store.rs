//! TTL + LRU response store backed by a sharded map

use super::tracker::{CacheMetrics, CacheStats};
use super::{CacheConfig, CacheError, MAX_TTL};
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct StoredEntry {
    data: Vec<u8>,
    compressed: bool,
    created_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    /// Monotonic access stamp; orders entries by recency even when the clock
    /// has not advanced between accesses
    access_seq: u64,
    access_count: u64,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            size: self.data.len(),
            compressed: self.compressed,
        }
    }
}

/// Bookkeeping for one cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    /// Exact bytes held for the stored (possibly compressed) payload
    pub size: usize,
    pub compressed: bool,
}

/// Concurrent response cache with per-entry TTL and LRU eviction
pub struct ResponseCache {
    entries: DashMap<String, StoredEntry>,
    total_bytes: AtomicUsize,
    access_clock: AtomicU64,
    config: RwLock<CacheConfig>,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            total_bytes: AtomicUsize::new(0),
            access_clock: AtomicU64::new(0),
            config: RwLock::new(config),
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the limits and evict immediately if the store is now over them.
    /// Returns the number of entries evicted.
    pub fn set_config(&self, config: CacheConfig) -> usize {
        info!(
            max_entries = config.max_entries,
            max_bytes = config.max_bytes,
            compression_threshold = config.compression_threshold,
            "Cache limits updated"
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.evict_if_over_limit()
    }

    fn next_seq(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up `key`, returning the decoded value if present and unexpired
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();

        let found = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.last_accessed = now;
                entry.access_count += 1;
                entry.access_seq = self.next_seq();
                Some((entry.data.clone(), entry.compressed))
            }
            Some(_) => None,
            None => {
                self.stats.record_miss();
                return None;
            }
        };

        let Some((data, compressed)) = found else {
            // Present but expired
            if self.remove_if(key, |e| e.is_expired(now)) {
                self.stats.record_expirations(1);
            }
            self.stats.record_miss();
            return None;
        };

        match decode::<T>(&data, compressed) {
            Ok(value) => {
                self.stats.record_hit();
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "Dropping undecodable cache entry");
                self.remove(key);
                self.stats.record_miss();
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`, compressing large payloads
    ///
    /// TTLs above [`MAX_TTL`] are clamped.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let config = self.config();
        let raw = serde_json::to_vec(value)?;
        let compressed = raw.len() > config.compression_threshold;
        let data = if compressed { compress(&raw)? } else { raw };

        if data.len() > config.max_bytes {
            return Err(CacheError::TooLarge {
                size: data.len(),
                max: config.max_bytes,
            });
        }

        let now = Instant::now();
        let ttl = ttl.min(MAX_TTL);
        let expires_at = now.checked_add(ttl).unwrap_or(now);
        let size = data.len();
        let entry = StoredEntry {
            data,
            compressed,
            created_at: now,
            expires_at,
            last_accessed: now,
            access_seq: self.next_seq(),
            access_count: 0,
        };

        // Count the new bytes before releasing the old ones so the total never
        // under-reports while both are briefly accounted.
        self.total_bytes.fetch_add(size, Ordering::AcqRel);
        if let Some(old) = self.entries.insert(key.to_string(), entry) {
            self.total_bytes.fetch_sub(old.data.len(), Ordering::AcqRel);
        }
        self.stats.record_write(compressed);
        debug!(key, size, compressed, "Cached response");

        self.evict_if_over_limit();
        Ok(())
    }

    /// Remove every entry whose key matches `predicate`. Returns the number removed.
    pub fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| predicate(e.key()))
            .map(|e| e.key().clone())
            .collect();

        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Evict least recently accessed entries, one at a time, until both the
    /// entry and byte limits hold. Returns the number evicted.
    pub fn evict_if_over_limit(&self) -> usize {
        let config = self.config();
        let mut evicted = 0;

        while self.entries.len() > config.max_entries
            || self.total_bytes.load(Ordering::Acquire) > config.max_bytes
        {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| e.access_seq)
                .map(|e| e.key().clone());

            let Some(key) = victim else { break };
            if self.remove(&key) {
                self.stats.record_eviction();
                evicted += 1;
                debug!(key, "Evicted least recently used cache entry");
            }
        }

        evicted
    }

    /// Remove all entries past their expiry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let removed = expired
            .iter()
            .filter(|k| self.remove_if(k, |e| e.is_expired(now)))
            .count();
        self.stats.record_expirations(removed);
        removed
    }

    pub fn metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.entries.get(key).map(|e| e.metadata())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn reset_metrics(&self) {
        self.stats.reset();
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.stats.snapshot(self.len(), self.total_bytes())
    }

    fn remove(&self, key: &str) -> bool {
        self.remove_if(key, |_| true)
    }

    fn remove_if(&self, key: &str, f: impl FnOnce(&StoredEntry) -> bool) -> bool {
        match self.entries.remove_if(key, |_, e| f(e)) {
            Some((_, entry)) => {
                self.total_bytes.fetch_sub(entry.data.len(), Ordering::AcqRel);
                true
            }
            None => false,
        }
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decode<T: DeserializeOwned>(data: &[u8], compressed: bool) -> Result<T, CacheError> {
    if compressed {
        let mut raw = Vec::new();
        GzDecoder::new(data).read_to_end(&mut raw)?;
        Ok(serde_json::from_slice(&raw)?)
    } else {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Spawn the periodic expiry sweep. Stops when `cancel` fires.
pub fn spawn_sweeper(
    cache: Arc<ResponseCache>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = cache.sweep_expired();
                    if removed > 0 {
                        debug!(removed, "Swept expired cache entries");
                    }
                }
            }
        }
    })
}
