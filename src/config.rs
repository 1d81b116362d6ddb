use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempdir::TempDir;

use crate::{DEVICE_BLOCK_SIZE, Error, Result, record::BLOCK_HEADER_LEN};

const DEFAULT_PATH: &str = "default.logcache";

/// Decides how much the background flusher writes on each sweep.
/// Explicit calls to [`crate::BlockCache::flush`] always write
/// every dirty block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Write at most `max_batch` of the longest-dirty blocks per sweep.
    OldestFirst {
        /// The largest number of blocks handed to the serializer per sweep.
        max_batch: usize,
    },
    /// Write every dirty block and then checkpoint the index on each sweep.
    AllAtCheckpoint,
}

/// Top-level configuration for the system.
///
/// # Examples
///
/// ```
/// let _config = logcache::Config::new()
///     .path("/path/to/data".to_owned())
///     .cache_capacity_bytes(64 * 1024 * 1024)
///     .flush_every_ms(Some(500));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// The directory that holds the log file.
    pub path: PathBuf,
    /// Remove the storage directory once the last clone of this
    /// `Config` is dropped. If no path is set, a fresh temporary
    /// directory is used.
    pub temporary: bool,
    /// The size in bytes of the static header and of each metablock.
    pub device_block_size: usize,
    /// The size in bytes of one log slot, including its record header.
    pub block_size: usize,
    /// The size in bytes of one extent. Must be a multiple of both
    /// `block_size` and `device_block_size`.
    pub extent_size: usize,
    /// Clean blocks are evicted least-recently-used first while the
    /// resident blocks exceed this many bytes. Every resident block is
    /// charged `block_size` bytes.
    pub cache_capacity_bytes: usize,
    /// Milliseconds between background flusher sweeps, or `None` to
    /// only flush when asked.
    pub flush_every_ms: Option<u64>,
    /// What the background flusher writes on each sweep.
    pub flush_policy: FlushPolicy,
    /// How many times a failed flush batch is retried before the
    /// failure is installed as a fatal error.
    pub flush_retries: usize,
    /// The maximum number of disk requests outstanding at once.
    pub io_depth: usize,
    /// The number of threads performing disk requests.
    pub io_threads: usize,
    /// How many times transient disk errors are retried.
    pub io_retries: usize,
    /// Closed extents whose fraction of live slots falls below this
    /// are relocated and freed by garbage collection.
    pub gc_threshold: f64,
    /// Write a metablock after this many write batches.
    pub checkpoint_interval: usize,
    /// The zstd level used to compress index snapshots.
    pub zstd_compression_level: i32,
    pub(crate) tempdir_deleter: Option<Arc<TempDir>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: DEFAULT_PATH.into(),
            temporary: false,
            device_block_size: DEVICE_BLOCK_SIZE,
            block_size: 4096,
            extent_size: 512 * 1024,
            cache_capacity_bytes: 256 * 1024 * 1024,
            flush_every_ms: Some(200),
            flush_policy: FlushPolicy::OldestFirst { max_batch: 1024 },
            flush_retries: 3,
            io_depth: 64,
            io_threads: 4,
            io_retries: 3,
            gc_threshold: 0.2,
            checkpoint_interval: 64,
            zstd_compression_level: 3,
            tempdir_deleter: None,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Self {
                self.$name = to;
                self
            }
        )*
    }
}

macro_rules! supported {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return Err(Error::Unsupported($msg.to_owned()));
        }
    };
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Config::default()
    }

    /// Set the path of the storage directory (builder).
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Config {
        self.path = path.as_ref().to_path_buf();
        self
    }

    /// Places the store in a fresh directory that is deleted after the
    /// last clone of this `Config` is dropped. The directory is created
    /// under the configured path if one was set, otherwise under the
    /// system temporary directory.
    pub fn temporary(mut self, to: bool) -> Config {
        self.temporary = to;

        if !to {
            self.tempdir_deleter = None;
            return self;
        }

        let tempdir = if self.path == PathBuf::from(DEFAULT_PATH) {
            TempDir::new("logcache")
        } else {
            std::fs::create_dir_all(&self.path)
                .and_then(|_| TempDir::new_in(&self.path, "logcache"))
        };

        match tempdir {
            Ok(tempdir) => {
                self.path = tempdir.path().join("store");
                self.tempdir_deleter = Some(Arc::new(tempdir));
            }
            Err(e) => {
                log::warn!(
                    "unable to create temporary directory under {:?}, \
                    the store will not be removed on drop: {:?}",
                    self.path,
                    e
                );
            }
        }

        self
    }

    builder!(
        (device_block_size, usize, "size of the static header and of each metablock slot"),
        (block_size, usize, "size of one log slot, including its 32 byte record header"),
        (extent_size, usize, "size of one extent, a multiple of block_size and device_block_size"),
        (cache_capacity_bytes, usize, "maximum bytes of clean block contents kept resident"),
        (flush_every_ms, Option<u64>, "number of ms between background flushes, or None"),
        (flush_policy, FlushPolicy, "what the background flusher writes on each sweep"),
        (flush_retries, usize, "retries of a failed flush batch before it becomes fatal"),
        (io_depth, usize, "maximum number of outstanding disk requests"),
        (io_threads, usize, "number of threads performing disk requests"),
        (io_retries, usize, "retries of a disk request that failed transiently"),
        (gc_threshold, f64, "live fraction below which closed extents are garbage collected"),
        (checkpoint_interval, usize, "number of write batches between metablock writes"),
        (zstd_compression_level, i32, "the zstd level used for index snapshots")
    );

    /// The largest block payload that fits into one slot.
    pub fn max_payload(&self) -> usize {
        self.block_size - BLOCK_HEADER_LEN
    }

    /// The number of block slots in one extent.
    pub fn slots_per_extent(&self) -> u32 {
        u32::try_from(self.extent_size / self.block_size)
            .expect("extent holds more than u32::MAX slots")
    }

    /// Returns the path of the log file inside the storage directory.
    pub(crate) fn data_path(&self) -> PathBuf {
        self.path.join("data")
    }

    /// Checks that the configured geometry and limits are usable.
    pub fn validate(&self) -> Result<()> {
        supported!(
            self.device_block_size >= 512
                && self.device_block_size.is_power_of_two(),
            "device_block_size must be a power of two of at least 512"
        );
        supported!(
            self.block_size > BLOCK_HEADER_LEN + 8,
            "block_size must leave room for the record header and payload"
        );
        supported!(
            self.extent_size % self.block_size == 0,
            "extent_size must be a multiple of block_size"
        );
        supported!(
            self.extent_size % self.device_block_size == 0,
            "extent_size must be a multiple of device_block_size"
        );
        supported!(
            self.extent_size / self.block_size >= 2,
            "an extent must hold at least two block slots"
        );
        supported!(self.io_depth > 0, "io_depth must be greater than 0");
        supported!(self.io_threads > 0, "io_threads must be greater than 0");
        supported!(
            self.gc_threshold >= 0.0 && self.gc_threshold <= 1.0,
            "gc_threshold must be between 0.0 and 1.0"
        );
        supported!(
            self.checkpoint_interval > 0,
            "checkpoint_interval must be greater than 0"
        );
        if let FlushPolicy::OldestFirst { max_batch } = self.flush_policy {
            supported!(max_batch > 0, "flush batches must not be empty");
        }
        Ok(())
    }
}
