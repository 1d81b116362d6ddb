//! The framing of one log slot.
//!
//! ```text
//! 0      1      4      8          16         24     28     32
//! | kind | pad  | len  | block_id | lsn      | crc  | pad  | payload ... zeroes |
//! ```
//!
//! All integers are little endian. The crc32 covers the header with
//! the crc field zeroed, followed by the `len` payload bytes, and is
//! xored with `0xAF` so a slot of zeroes never validates.

use crate::{BlockId, Lsn};

/// The number of bytes at the start of every log slot that frame the
/// block payload.
pub const BLOCK_HEADER_LEN: usize = 32;

const CRC_OFFSET: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    /// A version of a block's contents.
    Data,
    /// A tombstone: the block was deleted at this lsn.
    Delete,
    /// A chunk of a compressed index snapshot.
    Index,
}

impl RecordKind {
    fn to_byte(self) -> u8 {
        match self {
            RecordKind::Data => 1,
            RecordKind::Delete => 2,
            RecordKind::Index => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<RecordKind> {
        match byte {
            1 => Some(RecordKind::Data),
            2 => Some(RecordKind::Delete),
            3 => Some(RecordKind::Index),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Record<'a> {
    pub kind: RecordKind,
    pub block_id: BlockId,
    pub lsn: Lsn,
    pub payload: &'a [u8],
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Slot<'a> {
    /// Never written since the extent was created.
    Unwritten,
    /// Fails validation, usually a torn write.
    Corrupt,
    Valid(Record<'a>),
}

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..CRC_OFFSET]);
    hasher.update(&[0; 4]);
    hasher.update(&header[CRC_OFFSET + 4..BLOCK_HEADER_LEN]);
    hasher.update(payload);
    hasher.finalize() ^ 0xAF
}

/// Frames `payload` into a full `block_size` slot image.
pub(crate) fn encode(
    kind: RecordKind,
    block_id: BlockId,
    lsn: Lsn,
    payload: &[u8],
    block_size: usize,
) -> Vec<u8> {
    assert!(
        payload.len() + BLOCK_HEADER_LEN <= block_size,
        "payload of {} bytes does not fit a {} byte slot",
        payload.len(),
        block_size
    );

    let len = u32::try_from(payload.len()).expect("slot payloads fit in a u32");

    let mut buf = vec![0; block_size];
    buf[0] = kind.to_byte();
    buf[4..8].copy_from_slice(&len.to_le_bytes());
    buf[8..16].copy_from_slice(&block_id.to_le_bytes());
    buf[16..24].copy_from_slice(&lsn.to_le_bytes());
    buf[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + payload.len()]
        .copy_from_slice(payload);

    let crc = checksum(&buf[..BLOCK_HEADER_LEN], payload);
    buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());

    buf
}

/// Parses one slot image. `slot` must be exactly one slot long.
pub(crate) fn decode(slot: &[u8]) -> Slot<'_> {
    if slot.len() < BLOCK_HEADER_LEN {
        return Slot::Corrupt;
    }

    let header = &slot[..BLOCK_HEADER_LEN];
    if header.iter().all(|b| *b == 0) {
        return Slot::Unwritten;
    }

    let Some(kind) = RecordKind::from_byte(header[0]) else {
        return Slot::Corrupt;
    };

    let len = u32_at(header, 4) as usize;
    if len > slot.len() - BLOCK_HEADER_LEN {
        return Slot::Corrupt;
    }

    let payload = &slot[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + len];
    if checksum(header, payload) != u32_at(header, CRC_OFFSET) {
        return Slot::Corrupt;
    }

    Slot::Valid(Record {
        kind,
        block_id: u64_at(header, 8),
        lsn: u64_at(header, 16),
        payload,
    })
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
