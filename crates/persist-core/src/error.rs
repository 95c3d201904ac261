//! Error types for the settings store

use core::fmt;

use thiserror_no_std::Error;

use crate::storage::generation::Generation;

/// Filesystem primitive that failed.
///
/// Carried by [`PersistError::Io`] so a failure can be traced back to the
/// step that produced it without holding on to the driver's error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Mount,
    MakeDir,
    Open,
    Close,
    Seek,
    Read,
    Write,
    Sync,
    Remove,
    Stat,
    Eof,
    Remaining,
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mount => "mount",
            Self::MakeDir => "mkdir",
            Self::Open => "open",
            Self::Close => "close",
            Self::Seek => "seek",
            Self::Read => "read",
            Self::Write => "write",
            Self::Sync => "sync",
            Self::Remove => "unlink",
            Self::Stat => "stat",
            Self::Eof => "eof",
            Self::Remaining => "remaining",
        };
        f.write_str(name)
    }
}

/// Failure of a persistence operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistError {
    /// A filesystem primitive failed
    #[error("persistence I/O failed during {0}")]
    Io(FsOp),
    /// Fewer bytes were read than the slot or window required
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    /// The filesystem accepted fewer bytes than were written
    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },
    /// Stored checksum did not match the generation's content
    #[error("checksum mismatch in {0}")]
    Integrity(Generation),
    /// No generation file exists yet
    #[error("no persisted generation found")]
    NoGeneration,
    /// Slot index whose byte offset does not fit a file
    #[error("value index {0} out of range")]
    OutOfRange(u32),
    /// Refused because the machine is in motion
    #[error("machine is moving, persistence refused")]
    Busy,
    /// Byte-addressable storage driver failure
    #[error("non-volatile memory access failed")]
    Storage,
}

/// Builds a `map_err` adapter that logs the driver error and tags it with
/// the failing operation.
pub(crate) fn io<E: fmt::Debug>(op: FsOp) -> impl FnOnce(E) -> PersistError {
    move |e| {
        log::debug!("persistence {} failed: {:?}", op, e);
        PersistError::Io(op)
    }
}
