//! The metablock ring.
//!
//! A metablock is the root of recovery: it names the log sequence
//! number up to which the index snapshot it points at is complete.
//! Metablocks are written round-robin into a ring of device-block
//! slots spread over [`MB_NEXTENTS`] reserved extents, each with a
//! strictly increasing generation. A torn metablock write can only
//! damage the slot being written, never the newest valid one, so
//! recovery picks the valid frame with the highest generation.

use serde::{Deserialize, Serialize};

use crate::{
    Account, Config, Error, IoBackend, Location, Lsn, Result,
    extent::reserved_extents,
    header::{frame, unframe},
};

/// The number of extents reserved for the metablock ring.
pub const MB_NEXTENTS: u64 = 2;

/// The distance, in extents, between two metablock extents.
pub const MB_EXTENT_SEPARATION: u64 = 4;

const METABLOCK_MAGIC: u64 = u64::from_le_bytes(*b"metablck");

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Metablock {
    /// Strictly increasing across all metablocks of a store.
    pub generation: u64,
    /// Every record with an lsn at or below this is reflected by the
    /// index snapshot.
    pub last_lsn: Lsn,
    /// The lsn the next write will receive.
    pub next_lsn: Lsn,
    /// The first chunk of the index snapshot chain, if any blocks
    /// existed when it was written.
    pub index_head: Option<Location>,
    /// The number of chunks in the snapshot chain.
    pub index_chunks: u64,
    /// The compressed length of the snapshot.
    pub index_len: u64,
    /// The extent that was receiving appends when this metablock was
    /// written. It may hold records newer than `last_lsn` even though
    /// the snapshot references it.
    pub active_extent: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct MetablockManager {
    slots: Vec<u64>,
    device_block_size: usize,
    generation: u64,
}

impl MetablockManager {
    pub(crate) fn new(config: &Config) -> MetablockManager {
        let per_extent = config.extent_size / config.device_block_size;
        let mut slots = vec![];
        for extent in reserved_extents() {
            let start = extent * config.extent_size as u64;
            for j in 0..per_extent {
                let offset = start + (j * config.device_block_size) as u64;
                if offset == 0 {
                    // the static header
                    continue;
                }
                slots.push(offset);
            }
        }

        MetablockManager {
            slots,
            device_block_size: config.device_block_size,
            generation: 0,
        }
    }

    /// The byte offsets of every slot in the ring.
    pub(crate) fn slot_offsets(&self) -> &[u64] {
        &self.slots
    }

    /// Scans every ring slot and returns the valid metablock with the
    /// highest generation.
    pub(crate) fn read_latest(
        &mut self,
        backend: &IoBackend,
        config: &Config,
    ) -> Result<Option<Metablock>> {
        let mut latest: Option<Metablock> = None;
        let mut corrupt = 0;

        for extent in reserved_extents() {
            let start = extent * config.extent_size as u64;
            let buf =
                backend.read_at(&Account::DEFAULT, start, config.extent_size)?;

            for (j, slot) in buf.chunks(self.device_block_size).enumerate() {
                let offset = start + (j * self.device_block_size) as u64;
                if offset == 0 || slot.iter().all(|b| *b == 0) {
                    continue;
                }

                let decoded = unframe(METABLOCK_MAGIC, slot)
                    .and_then(|body| bincode::deserialize::<Metablock>(body).ok());

                match decoded {
                    Some(mb) => {
                        log::trace!("found metablock {:?} at offset {}", mb, offset);
                        if latest
                            .as_ref()
                            .map(|l| mb.generation > l.generation)
                            .unwrap_or(true)
                        {
                            latest = Some(mb);
                        }
                    }
                    None => {
                        corrupt += 1;
                        log::warn!(
                            "skipping corrupt metablock slot at offset {}",
                            offset
                        );
                    }
                }
            }
        }

        if let Some(mb) = &latest {
            log::debug!(
                "latest metablock has generation {} and last lsn {}, \
                {} corrupt slots skipped",
                mb.generation,
                mb.last_lsn,
                corrupt
            );
            self.generation = mb.generation;
        }

        Ok(latest)
    }

    /// Assigns the next generation to `metablock` and makes it
    /// durable in the next ring slot.
    pub(crate) fn write(
        &mut self,
        backend: &IoBackend,
        metablock: &mut Metablock,
    ) -> Result<()> {
        metablock.generation = self.generation + 1;

        let body = bincode::serialize(&*metablock)
            .map_err(|e| Error::ReportableBug(e.to_string()))?;
        let buf = frame(METABLOCK_MAGIC, &body, self.device_block_size)?;

        let slot = self.slots[(metablock.generation % self.slots.len() as u64)
            as usize];

        backend.write_at(&Account::DEFAULT, slot, buf)?;
        backend.sync(&Account::DEFAULT)?;

        log::debug!(
            "wrote metablock generation {} at offset {}",
            metablock.generation,
            slot
        );
        self.generation = metablock.generation;
        Ok(())
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}
