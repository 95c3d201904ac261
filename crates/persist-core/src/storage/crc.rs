//! CRC32 trailer handling
//!
//! Each generation ends with a little-endian CRC-32/ISO-HDLC (the zlib
//! polynomial) of every byte before it.

use crc::{CRC_32_ISO_HDLC, Crc, Digest};

use super::fs::BlockFilesystem;
use crate::error::{FsOp, PersistError, io};

/// Length of the checksum trailer in bytes
pub const CRC_LEN: usize = 4;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC32 accumulated over a sequence of buffers.
///
/// Feeding the content in several windows gives the same result as one
/// checksum over the concatenation.
pub struct RunningCrc {
    digest: Digest<'static, u32>,
}

impl RunningCrc {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for RunningCrc {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot checksum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Streams an open file through the checksum and compares it with the
/// trailer.
///
/// The last [`CRC_LEN`] bytes seen are always held back from the running
/// checksum, so whatever chunk the end of file falls in, the held bytes are
/// the stored trailer. A file too short to contain a trailer never
/// validates.
///
/// Returns `Ok(false)` on mismatch; filesystem errors are hard failures.
pub fn verify_checksum<F: BlockFilesystem>(
    fs: &mut F,
    file: F::File,
    buf: &mut [u8],
) -> Result<bool, PersistError> {
    fs.seek(file, 0).map_err(io(FsOp::Seek))?;

    let mut crc = RunningCrc::new();
    let mut held = [0u8; CRC_LEN];
    let mut held_len = 0;

    while !fs.is_eof(file).map_err(io(FsOp::Eof))? {
        let read = fs.read(file, buf).map_err(io(FsOp::Read))?;
        if read == 0 {
            return Err(PersistError::ShortRead {
                expected: buf.len(),
                actual: 0,
            });
        }

        let total = held_len + read;
        if total <= CRC_LEN {
            held[held_len..total].copy_from_slice(&buf[..read]);
            held_len = total;
            continue;
        }

        // Release everything except the newest CRC_LEN bytes
        let release = total - CRC_LEN;
        let from_held = release.min(held_len);
        let from_buf = release - from_held;
        crc.update(&held[..from_held]);
        crc.update(&buf[..from_buf]);

        let mut next = [0u8; CRC_LEN];
        let kept = held_len - from_held;
        next[..kept].copy_from_slice(&held[from_held..held_len]);
        next[kept..].copy_from_slice(&buf[from_buf..read]);
        held = next;
        held_len = CRC_LEN;
    }

    let stored = (held_len == CRC_LEN).then(|| u32::from_le_bytes(held));
    let computed = crc.finalize();
    log::debug!("crc: {:?} from file, {} calculated", stored, computed);

    Ok(stored == Some(computed))
}
