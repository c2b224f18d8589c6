//! LRU record cache
//!
//! Bounded, strictly least-recently-used cache of records keyed by record
//! key. Values go in and come out as owned clones, so nothing outside the
//! cache can mutate a cached record. All operations serialize on one
//! mutex; the cache is shareable between readers but is not a substitute
//! for the engine's write lock.

use docvault_common::{Record, RecordKey};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy for reporting
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Plain copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
}

/// Strict LRU cache of records
pub struct RecordCache {
    /// `None` when capacity is zero (caching disabled)
    entries: Option<Mutex<LruCache<RecordKey, Record>>>,
    capacity: usize,
    stats: CacheStats,
}

impl RecordCache {
    /// Create a new cache holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Look up a record, promoting it to most-recently-used
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        let hit = self
            .entries
            .as_ref()
            .and_then(|entries| entries.lock().get(key).cloned());
        let counter = if hit.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// Insert or replace a record, evicting the oldest entry when full
    pub fn put(&self, key: RecordKey, record: &Record) {
        let Some(entries) = &self.entries else {
            return;
        };
        let mut entries = entries.lock();
        if let Some((old_key, _)) = entries.push(key.clone(), record.clone()) {
            // push hands back the replaced entry on update, the LRU victim otherwise
            if old_key != key {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove a record
    pub fn delete(&self, key: &RecordKey) -> Option<Record> {
        self.entries
            .as_ref()
            .and_then(|entries| entries.lock().pop(key))
    }

    /// Check if key is cached, without promoting it
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.lock().contains(key))
    }

    /// Drop every entry
    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    /// Get current cache size
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
