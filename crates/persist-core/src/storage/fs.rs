//! Block filesystem boundary
//!
//! The store only needs sequential file primitives. Paths are at most one
//! directory deep (`dir/name.ext`) so FAT 8.3 drivers can serve them.

use core::fmt::Debug;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read only
    Read,
    /// Create the file or truncate an existing one, write only
    CreateTruncate,
}

/// Result of polling the removable medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    /// Medium present, nothing changed since the last poll
    Present,
    /// No medium in the slot
    Absent,
    /// Medium was removed or swapped since the last poll; every handle
    /// opened before is gone
    Changed,
}

/// Filesystem driver consumed by the rotating-file store.
///
/// Handles are plain copyable tokens; the store is responsible for closing
/// every handle it opens.
pub trait BlockFilesystem {
    type Error: Debug;
    type File: Copy + Debug;

    fn is_mounted(&self) -> bool;

    fn mount(&mut self) -> Result<(), Self::Error>;

    /// Creates a directory. An existing directory is not an error.
    fn make_dir(&mut self, dir: &str) -> Result<(), Self::Error>;

    fn exists(&mut self, path: &str) -> Result<bool, Self::Error>;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File, Self::Error>;

    fn close(&mut self, file: Self::File) -> Result<(), Self::Error>;

    /// Checks that a handle still refers to an open file on the mounted
    /// medium. Fails after a media swap even if the handle looks open.
    fn validate(&mut self, file: Self::File) -> Result<(), Self::Error>;

    fn seek(&mut self, file: Self::File, offset: u32) -> Result<(), Self::Error>;

    /// Reads up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, file: Self::File, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Writes `buf`, returning how many bytes were accepted.
    fn write(&mut self, file: Self::File, buf: &[u8]) -> Result<usize, Self::Error>;

    /// Commits written data and directory metadata to the medium.
    fn sync(&mut self, file: Self::File) -> Result<(), Self::Error>;

    fn remove(&mut self, path: &str) -> Result<(), Self::Error>;

    fn is_eof(&mut self, file: Self::File) -> Result<bool, Self::Error>;

    /// Bytes between the file position and the end of the file.
    fn remaining(&mut self, file: Self::File) -> Result<u32, Self::Error>;

    fn poll_media(&mut self) -> MediaStatus;
}

/// Splits `dir/name` into its parts; a bare name lives in the root.
pub fn split_path(path: &str) -> (Option<&str>, &str) {
    match path.split_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    }
}
