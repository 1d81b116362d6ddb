//! The static header at offset 0 of the log file, plus the crc'd
//! framing shared with metablocks.
//!
//! ```text
//! | magic u64 | len u32 | crc u32 | body (len bytes) | zeroes ... |
//! ```
//!
//! A frame always occupies exactly one device block.

use serde::{Deserialize, Serialize};

use crate::{
    Account, Config, Error, IoBackend, Result, MB_EXTENT_SEPARATION,
    MB_NEXTENTS,
};

const FRAME_HEADER_LEN: usize = 16;
const HEADER_MAGIC: u64 = u64::from_le_bytes(*b"logcache");
const FORMAT_VERSION: u32 = 1;

fn frame_crc(magic: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&magic.to_le_bytes());
    hasher.update(&(body.len() as u32).to_le_bytes());
    hasher.update(body);
    // xor the crc with 0xAF so zeroed frames never validate
    hasher.finalize() ^ 0xAF
}

/// Wraps `body` into a frame of exactly `size` bytes.
pub(crate) fn frame(magic: u64, body: &[u8], size: usize) -> Result<Vec<u8>> {
    if body.len() + FRAME_HEADER_LEN > size {
        return Err(Error::ReportableBug(format!(
            "frame body of {} bytes does not fit into {} bytes",
            body.len(),
            size
        )));
    }

    let mut buf = vec![0; size];
    buf[..8].copy_from_slice(&magic.to_le_bytes());
    buf[8..12].copy_from_slice(&(body.len() as u32).to_le_bytes());
    buf[12..16].copy_from_slice(&frame_crc(magic, body).to_le_bytes());
    buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body.len()].copy_from_slice(body);
    Ok(buf)
}

/// Returns the body of a valid frame with the expected magic.
pub(crate) fn unframe(magic: u64, buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }

    let mut u64_buf = [0; 8];
    u64_buf.copy_from_slice(&buf[..8]);
    if u64::from_le_bytes(u64_buf) != magic {
        return None;
    }

    let mut u32_buf = [0; 4];
    u32_buf.copy_from_slice(&buf[8..12]);
    let len = u32::from_le_bytes(u32_buf) as usize;
    if len > buf.len() - FRAME_HEADER_LEN {
        return None;
    }

    u32_buf.copy_from_slice(&buf[12..16]);
    let expected_crc = u32::from_le_bytes(u32_buf);

    let body = &buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
    if frame_crc(magic, body) != expected_crc {
        return None;
    }

    Some(body)
}

/// The geometry a log file was created with. It can never change for
/// the lifetime of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StaticHeader {
    version: u32,
    device_block_size: u64,
    block_size: u64,
    extent_size: u64,
    mb_nextents: u64,
    mb_extent_separation: u64,
}

impl StaticHeader {
    pub(crate) fn for_config(config: &Config) -> StaticHeader {
        StaticHeader {
            version: FORMAT_VERSION,
            device_block_size: config.device_block_size as u64,
            block_size: config.block_size as u64,
            extent_size: config.extent_size as u64,
            mb_nextents: MB_NEXTENTS,
            mb_extent_separation: MB_EXTENT_SEPARATION,
        }
    }

    fn check_compatible(&self, config: &Config) -> Result<()> {
        let expected = StaticHeader::for_config(config);
        if self.version != expected.version {
            return Err(Error::Unsupported(format!(
                "log file has format version {} but this build supports {}",
                self.version, expected.version
            )));
        }
        if *self != expected {
            return Err(Error::Unsupported(format!(
                "log file was created with geometry {:?}, which does not \
                match the configured {:?}",
                self, expected
            )));
        }
        Ok(())
    }

    /// Writes the header of a brand new log file.
    pub(crate) fn create(backend: &IoBackend, config: &Config) -> Result<()> {
        let header = StaticHeader::for_config(config);
        let body = bincode::serialize(&header)
            .map_err(|e| Error::ReportableBug(e.to_string()))?;
        let buf = frame(HEADER_MAGIC, &body, config.device_block_size)?;

        backend.write_at(&Account::DEFAULT, 0, buf)?;
        backend.sync(&Account::DEFAULT)?;
        log::debug!("wrote static header {:?}", header);
        Ok(())
    }

    /// Reads the header of an existing log file and checks that it
    /// matches the configured geometry.
    pub(crate) fn read_and_check(
        backend: &IoBackend,
        config: &Config,
    ) -> Result<StaticHeader> {
        let buf =
            backend.read_at(&Account::DEFAULT, 0, config.device_block_size)?;

        let Some(body) = unframe(HEADER_MAGIC, &buf) else {
            return Err(Error::Unrecoverable(
                "the static header at offset 0 is missing or corrupt"
                    .to_owned(),
            ));
        };

        let header: StaticHeader = bincode::deserialize(body).map_err(|e| {
            Error::Unrecoverable(format!(
                "failed to decode the static header: {e}"
            ))
        })?;

        header.check_compatible(config)?;
        Ok(header)
    }
}
