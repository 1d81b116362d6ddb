use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Relaxed};

use crate::BlockId;

/// Receives events from a [`crate::BlockCache`].
///
/// An observer is handed to the cache when it is opened, and every
/// method has an empty default, so implementations only override what
/// they care about. Methods are called while cache-internal locks may
/// be held, and must not call back into the cache.
pub trait CacheObserver: Send + Sync {
    /// A block was found in the cache.
    fn hit(&self, _block_id: BlockId) {}

    /// A block had to be read from the serializer.
    fn miss(&self, _block_id: BlockId) {}

    /// A clean block was dropped to stay within the cache capacity.
    fn evicted(&self, _block_id: BlockId) {}

    /// A flush durably wrote `blocks` blocks.
    fn flushed(&self, _blocks: usize) {}

    /// The number of resident blocks changed.
    fn resident(&self, _blocks: usize) {}
}

/// The stock [`CacheObserver`], counting every event.
#[derive(Default, Debug)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushed_blocks: AtomicU64,
    resident_blocks: AtomicU64,
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Acquires served from memory.
    pub hits: u64,
    /// Acquires that read through to the serializer.
    pub misses: u64,
    /// Clean blocks evicted.
    pub evictions: u64,
    /// Blocks written by flushes.
    pub flushed_blocks: u64,
    /// Blocks currently resident.
    pub resident_blocks: u64,
}

impl CacheStatsSnapshot {
    /// The fraction of acquires served from memory, or 0.0 before the
    /// first acquire.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

impl CacheStats {
    /// Copies out the current counter values.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Acquire),
            misses: self.misses.load(Acquire),
            evictions: self.evictions.load(Acquire),
            flushed_blocks: self.flushed_blocks.load(Acquire),
            resident_blocks: self.resident_blocks.load(Acquire),
        }
    }
}

impl CacheObserver for CacheStats {
    fn hit(&self, _block_id: BlockId) {
        self.hits.fetch_add(1, Relaxed);
    }

    fn miss(&self, _block_id: BlockId) {
        self.misses.fetch_add(1, Relaxed);
    }

    fn evicted(&self, _block_id: BlockId) {
        self.evictions.fetch_add(1, Relaxed);
    }

    fn flushed(&self, blocks: usize) {
        self.flushed_blocks.fetch_add(blocks as u64, Relaxed);
    }

    fn resident(&self, blocks: usize) {
        self.resident_blocks.store(blocks as u64, Relaxed);
    }
}

#[test]
fn hit_ratio_of_fresh_stats_is_zero() {
    let stats = CacheStats::default();
    assert_eq!(stats.snapshot().hit_ratio(), 0.0);
    stats.hit(1);
    stats.hit(1);
    stats.miss(2);
    stats.flushed(3);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.hits, 2);
    assert_eq!(snapshot.flushed_blocks, 3);
    assert!((snapshot.hit_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);
}
