//! Index snapshots.
//!
//! A checkpoint serializes the complete block index, compresses it
//! with zstd and stores it in the log as a chain of `Index` records.
//! Each chunk starts with a pointer to the next chunk:
//!
//! ```text
//! | has_next u8 | next extent u64 | next slot u32 | compressed bytes ... |
//! ```
//!
//! The record header of chunk `i` carries `i` as its block id and the
//! snapshot's `last_lsn` as its lsn, so a chunk can never be confused
//! with one from an older chain occupying a reused slot.
use std::io::{self, Read, Write};

use fault_injection::annotate;
use fnv::FnvHashMap;
use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::{
    Account, BlockId, Config, Error, IoBackend, Location, Lsn, Result,
    metablock::Metablock,
    record::{self, RecordKind, Slot},
};

const NEXT_POINTER_LEN: usize = 13;
const ENTRY_LEN: usize = 28;

/// Where the current version of a block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub location: Location,
    pub lsn: Lsn,
}

pub(crate) type BlockIndex = FnvHashMap<BlockId, IndexEntry>;

/// Serializes and compresses `index`, sorted by block id.
pub(crate) fn encode_index(
    index: &BlockIndex,
    level: i32,
) -> io::Result<Vec<u8>> {
    let mut entries: Vec<(&BlockId, &IndexEntry)> = index.iter().collect();
    entries.sort_unstable_by_key(|(block_id, _)| **block_id);

    // write format, repeated for each block:
    //  8 byte LE block id
    //  8 byte LE extent
    //  4 byte LE slot
    //  8 byte LE lsn
    let mut encoder = ZstdEncoder::new(Vec::new(), level)?;
    for (block_id, entry) in entries {
        encoder.write_all(&block_id.to_le_bytes())?;
        encoder.write_all(&entry.location.extent.to_le_bytes())?;
        encoder.write_all(&entry.location.slot.to_le_bytes())?;
        encoder.write_all(&entry.lsn.to_le_bytes())?;
    }
    encoder.finish()
}

pub(crate) fn decode_index(compressed: &[u8]) -> io::Result<BlockIndex> {
    let mut decoder = ZstdDecoder::new(compressed)?;
    let mut index = BlockIndex::default();

    let mut block_id_buf: [u8; 8] = [0; 8];
    let mut extent_buf: [u8; 8] = [0; 8];
    let mut slot_buf: [u8; 4] = [0; 4];
    let mut lsn_buf: [u8; 8] = [0; 8];
    loop {
        if let Err(e) = decoder.read_exact(&mut block_id_buf) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                break;
            }
            return Err(e);
        }

        decoder
            .read_exact(&mut extent_buf)
            .and_then(|_| decoder.read_exact(&mut slot_buf))
            .and_then(|_| decoder.read_exact(&mut lsn_buf))?;

        let block_id = u64::from_le_bytes(block_id_buf);
        let extent = u64::from_le_bytes(extent_buf);
        let slot = u32::from_le_bytes(slot_buf);
        let lsn = u64::from_le_bytes(lsn_buf);

        let previous = index.insert(
            block_id,
            IndexEntry { location: Location { extent, slot }, lsn },
        );
        if previous.is_some() {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::InvalidData,
                "index snapshot contains a block twice",
            )));
        }
    }

    Ok(index)
}

/// The number of chunks needed to store `len` compressed bytes.
pub(crate) fn chunks_needed(len: usize, config: &Config) -> usize {
    len.div_ceil(config.max_payload() - NEXT_POINTER_LEN)
}

fn chunk_payload(next: Option<Location>, part: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(NEXT_POINTER_LEN + part.len());
    let (has_next, next) = match next {
        Some(next) => (1_u8, next),
        None => (0, Location { extent: 0, slot: 0 }),
    };
    payload.push(has_next);
    payload.extend_from_slice(&next.extent.to_le_bytes());
    payload.extend_from_slice(&next.slot.to_le_bytes());
    payload.extend_from_slice(part);
    payload
}

fn parse_chunk(payload: &[u8]) -> Option<(Option<Location>, &[u8])> {
    if payload.len() < NEXT_POINTER_LEN {
        return None;
    }
    let next = match payload[0] {
        0 => None,
        1 => Some(Location {
            extent: u64::from_le_bytes(payload[1..9].try_into().ok()?),
            slot: u32::from_le_bytes(payload[9..13].try_into().ok()?),
        }),
        _ => return None,
    };
    Some((next, &payload[NEXT_POINTER_LEN..]))
}

/// Frames `compressed` into one slot image per location, each pointing
/// at the next. `locations` must hold exactly
/// [`chunks_needed`] entries.
pub(crate) fn chain_writes(
    compressed: &[u8],
    locations: &[Location],
    last_lsn: Lsn,
    config: &Config,
) -> Vec<(u64, Vec<u8>)> {
    let parts: Vec<&[u8]> =
        compressed.chunks(config.max_payload() - NEXT_POINTER_LEN).collect();
    assert_eq!(parts.len(), locations.len());

    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let next = locations.get(i + 1).copied();
            let payload = chunk_payload(next, part);
            let slot = record::encode(
                RecordKind::Index,
                i as u64,
                last_lsn,
                &payload,
                config.block_size,
            );
            (locations[i].offset(config.extent_size, config.block_size), slot)
        })
        .collect()
}

/// Follows the snapshot chain the metablock points at. Returns the
/// recovered index along with the location of every chunk.
pub(crate) fn read_chain(
    backend: &IoBackend,
    config: &Config,
    metablock: &Metablock,
) -> Result<(BlockIndex, Vec<Location>)> {
    let mut locations = vec![];
    let mut compressed = Vec::with_capacity(metablock.index_len as usize);
    let mut next = metablock.index_head;

    while let Some(location) = next {
        if locations.len() as u64 >= metablock.index_chunks {
            log::error!(
                "index snapshot chain is longer than the {} chunks recorded",
                metablock.index_chunks
            );
            return Err(Error::Corruption { at: location });
        }

        let buf = backend.read_at(
            &Account::DEFAULT,
            location.offset(config.extent_size, config.block_size),
            config.block_size,
        )?;

        let parsed = match record::decode(&buf) {
            Slot::Valid(record)
                if record.kind == RecordKind::Index
                    && record.block_id == locations.len() as u64
                    && record.lsn == metablock.last_lsn =>
            {
                parse_chunk(record.payload)
            }
            _ => None,
        };

        let Some((following, part)) = parsed else {
            log::error!("index snapshot chunk at {} is corrupt", location);
            return Err(Error::Corruption { at: location });
        };

        compressed.extend_from_slice(part);
        locations.push(location);
        next = following;
    }

    if locations.len() as u64 != metablock.index_chunks
        || compressed.len() as u64 != metablock.index_len
    {
        return Err(Error::Unrecoverable(format!(
            "index snapshot has {} chunks and {} bytes, but the metablock \
            recorded {} chunks and {} bytes",
            locations.len(),
            compressed.len(),
            metablock.index_chunks,
            metablock.index_len
        )));
    }

    let index = if compressed.is_empty() {
        BlockIndex::default()
    } else {
        decode_index(&compressed).map_err(|e| {
            Error::Unrecoverable(format!("failed to decode index snapshot: {e}"))
        })?
    };

    log::debug!(
        "loaded index snapshot of {} blocks from {} chunks",
        index.len(),
        locations.len()
    );

    Ok((index, locations))
}
