//! `logcache` is a buffer cache sitting on top of a log-structured
//! block serializer.
//!
//! Logical blocks are identified by a [`BlockId`]. Every write of a
//! block appends a new version to the tail of an append-only log made
//! of fixed-size extents, and a small ring of metablocks records where
//! the latest durable snapshot of the block index lives. On startup the
//! newest valid metablock is loaded and any log records written after
//! it are replayed, so the complete index is always reconstructible.
//!
//! The [`BlockCache`] hands out read or write handles to cached blocks
//! with many-readers/one-writer locking per block and strict FIFO
//! fairness between waiters, tracks dirtiness, and flushes dirty blocks
//! to the [`LogSerializer`] as write batches.
//!
//! # Examples
//!
//! ```
//! use logcache::{Access, BlockCache, Config};
//!
//! let config = Config::new().temporary(true).flush_every_ms(None);
//! let cache = BlockCache::open(config).unwrap();
//!
//! let mut handle = cache.allocate().unwrap();
//! let block_id = handle.block_id();
//! handle.data_mut().extend_from_slice(b"hello");
//! cache.release(handle);
//!
//! cache.flush().unwrap();
//!
//! let handle = cache.acquire(block_id, Access::Read).wait().unwrap();
//! assert_eq!(&*handle, b"hello");
//! ```
#![deny(missing_docs)]
#![cfg_attr(test, deny(clippy::bad_style))]
#![cfg_attr(test, deny(clippy::rust_2018_idioms))]

mod backoff;
mod barrier;
mod cache;
mod concurrency_control;
mod config;
mod disk;
mod extent;
mod flusher;
mod header;
mod id_allocator;
mod lru;
mod metablock;
mod metrics;
mod oneshot;
mod pool;
mod record;
mod result;
mod serializer;
mod snapshot;
mod spinlock;

pub use crate::{
    barrier::ThreadBarrier,
    cache::{BlockCache, BlockHandle, PendingAcquire},
    concurrency_control::Access,
    config::{Config, FlushPolicy},
    disk::{Account, IoBackend, IoStats},
    metablock::{MB_EXTENT_SEPARATION, MB_NEXTENTS},
    metrics::{CacheObserver, CacheStats, CacheStatsSnapshot},
    oneshot::{OneShot, OneShotFiller},
    pool::{BlockLock, WorkerPool},
    record::BLOCK_HEADER_LEN,
    result::{Error, Result},
    serializer::{BatchOp, LogSerializer, SerializerState, SerializerStats},
    spinlock::{Spinlock, SpinlockGuard},
};

pub(crate) use crate::result::GlobalError;

/// The default size of the unit of atomic device writes. The static
/// header and each metablock occupy exactly one device block.
pub const DEVICE_BLOCK_SIZE: usize = 4096;

/// A logical block identifier.
pub type BlockId = u64;

/// A log sequence number. Every version of a block written to the log
/// receives a strictly greater `Lsn` than any version before it, so it
/// doubles as the block's version number.
pub type Lsn = u64;

/// The physical position of one block-sized slot in the log.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Location {
    /// The extent that holds the slot.
    pub extent: u64,
    /// The index of the slot within its extent.
    pub slot: u32,
}

impl Location {
    /// Returns the byte offset of this slot in the log file.
    pub fn offset(&self, extent_size: usize, block_size: usize) -> u64 {
        self.extent * extent_size as u64 + self.slot as u64 * block_size as u64
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.extent, self.slot)
    }
}
