//! In-memory filesystem for tests
//!
//! Behaves like a FAT volume on a removable card closely enough to exercise
//! the store, and adds fault injection:
//! - one-shot failure of any primitive ([`MemFs::fail_next`])
//! - power loss after a number of writes ([`MemFs::cut_power_after_writes`])
//! - bit flips in stored files ([`MemFs::flip_bit`])
//! - card removal and swap ([`MemFs::remove_media`], [`MemFs::insert_media`])
//!
//! A mutation counter lets tests assert that an operation left the medium
//! untouched.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::Cell;

use embassy_time::Instant;

use super::crc::checksum;
use super::fs::{BlockFilesystem, MediaStatus, OpenMode, split_path};
use crate::clock::TickSource;
use crate::error::FsOp;
use crate::notify::{ExceptionSink, PersistException};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFsError {
    NotMounted,
    NotFound,
    BadHandle,
    ReadOnly,
    NoMedia,
    /// Failure requested through [`MemFs::fail_next`]
    Injected(FsOp),
    /// Writes after a simulated power cut
    PowerLoss,
}

/// Handle into [`MemFs`]'s open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFile(usize);

#[derive(Debug)]
struct OpenFile {
    path: String,
    pos: usize,
    writable: bool,
    /// Media epoch the file was opened under
    epoch: u32,
}

#[derive(Debug, Default)]
pub struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    handles: Vec<Option<OpenFile>>,
    mounted: bool,
    media_present: bool,
    media_changed: bool,
    epoch: u32,
    fail_ops: Vec<FsOp>,
    writes_until_power_loss: Option<usize>,
    mutations: usize,
    mounts: usize,
    syncs: usize,
}

impl MemFs {
    /// Empty, unmounted volume with a card inserted.
    pub fn new() -> Self {
        Self {
            media_present: true,
            ..Self::default()
        }
    }

    /// Volume that is already mounted.
    pub fn mounted() -> Self {
        Self {
            mounted: true,
            ..Self::new()
        }
    }

    /// Places a file directly on the medium, bypassing the mutation counter.
    pub fn insert_file(&mut self, path: &str, bytes: &[u8]) {
        if let (Some(dir), _) = split_path(path) {
            self.dirs.insert(dir.to_string());
        }
        self.files.insert(path.to_string(), bytes.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    /// Inverts one bit of a stored file.
    pub fn flip_bit(&mut self, path: &str, byte: usize, bit: u8) {
        if let Some(bytes) = self.files.get_mut(path) {
            bytes[byte] ^= 1 << bit;
        }
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&mut self, op: FsOp) {
        self.fail_ops.push(op);
    }

    /// Lets `writes` more write calls succeed, then fails every write as if
    /// power had been lost.
    pub fn cut_power_after_writes(&mut self, writes: usize) {
        self.writes_until_power_loss = Some(writes);
    }

    pub fn restore_power(&mut self) {
        self.writes_until_power_loss = None;
    }

    /// Pulls the card. Every handle becomes invalid.
    pub fn remove_media(&mut self) {
        self.media_present = false;
        self.media_changed = true;
        self.mounted = false;
        self.epoch += 1;
    }

    pub fn insert_media(&mut self) {
        self.media_present = true;
        self.media_changed = true;
    }

    /// Number of operations that modified the medium.
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    pub fn mounts(&self) -> usize {
        self.mounts
    }

    pub fn syncs(&self) -> usize {
        self.syncs
    }

    pub fn open_handles(&self) -> usize {
        self.handles.iter().filter(|h| h.is_some()).count()
    }

    fn check(&mut self, op: FsOp) -> Result<(), MemFsError> {
        if let Some(pos) = self.fail_ops.iter().position(|&o| o == op) {
            self.fail_ops.remove(pos);
            return Err(MemFsError::Injected(op));
        }
        if !self.media_present {
            return Err(MemFsError::NoMedia);
        }
        if op != FsOp::Mount && !self.mounted {
            return Err(MemFsError::NotMounted);
        }
        Ok(())
    }

    fn handle(&self, file: MemFile) -> Result<&OpenFile, MemFsError> {
        match self.handles.get(file.0) {
            Some(Some(open)) if open.epoch == self.epoch => Ok(open),
            _ => Err(MemFsError::BadHandle),
        }
    }

    fn handle_mut(&mut self, file: MemFile) -> Result<&mut OpenFile, MemFsError> {
        let epoch = self.epoch;
        match self.handles.get_mut(file.0) {
            Some(Some(open)) if open.epoch == epoch => Ok(open),
            _ => Err(MemFsError::BadHandle),
        }
    }

    fn len_of(&self, file: MemFile) -> Result<(usize, usize), MemFsError> {
        let open = self.handle(file)?;
        let len = self.files.get(&open.path).map_or(0, Vec::len);
        Ok((open.pos, len))
    }
}

impl BlockFilesystem for MemFs {
    type Error = MemFsError;
    type File = MemFile;

    fn is_mounted(&self) -> bool {
        self.mounted
    }

    fn mount(&mut self) -> Result<(), MemFsError> {
        self.check(FsOp::Mount)?;
        self.mounted = true;
        self.mounts += 1;
        Ok(())
    }

    fn make_dir(&mut self, dir: &str) -> Result<(), MemFsError> {
        self.check(FsOp::MakeDir)?;
        if self.dirs.insert(dir.to_string()) {
            self.mutations += 1;
        }
        Ok(())
    }

    fn exists(&mut self, path: &str) -> Result<bool, MemFsError> {
        self.check(FsOp::Stat)?;
        Ok(self.files.contains_key(path))
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<MemFile, MemFsError> {
        self.check(FsOp::Open)?;
        match mode {
            OpenMode::Read => {
                if !self.files.contains_key(path) {
                    return Err(MemFsError::NotFound);
                }
            }
            OpenMode::CreateTruncate => {
                if let (Some(dir), _) = split_path(path) {
                    if !self.dirs.contains(dir) {
                        return Err(MemFsError::NotFound);
                    }
                }
                self.files.insert(path.to_string(), Vec::new());
                self.mutations += 1;
            }
        }

        let open = OpenFile {
            path: path.to_string(),
            pos: 0,
            writable: mode == OpenMode::CreateTruncate,
            epoch: self.epoch,
        };
        let slot = match self.handles.iter().position(Option::is_none) {
            Some(slot) => {
                self.handles[slot] = Some(open);
                slot
            }
            None => {
                self.handles.push(Some(open));
                self.handles.len() - 1
            }
        };
        Ok(MemFile(slot))
    }

    fn close(&mut self, file: MemFile) -> Result<(), MemFsError> {
        // A handle from before a card swap is released without error checks
        let slot = self.handles.get_mut(file.0).ok_or(MemFsError::BadHandle)?;
        if slot.take().is_none() {
            return Err(MemFsError::BadHandle);
        }
        self.check(FsOp::Close)
    }

    fn validate(&mut self, file: MemFile) -> Result<(), MemFsError> {
        if !self.media_present || !self.mounted {
            return Err(MemFsError::NoMedia);
        }
        self.handle(file).map(|_| ())
    }

    fn seek(&mut self, file: MemFile, offset: u32) -> Result<(), MemFsError> {
        self.check(FsOp::Seek)?;
        let (_, len) = self.len_of(file)?;
        self.handle_mut(file)?.pos = (offset as usize).min(len);
        Ok(())
    }

    fn read(&mut self, file: MemFile, buf: &mut [u8]) -> Result<usize, MemFsError> {
        self.check(FsOp::Read)?;
        let open = self.handle(file)?;
        let data = self.files.get(&open.path).ok_or(MemFsError::NotFound)?;
        let start = open.pos.min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.handle_mut(file)?.pos = start + count;
        Ok(count)
    }

    fn write(&mut self, file: MemFile, buf: &[u8]) -> Result<usize, MemFsError> {
        self.check(FsOp::Write)?;
        if let Some(left) = self.writes_until_power_loss.as_mut() {
            if *left == 0 {
                return Err(MemFsError::PowerLoss);
            }
            *left -= 1;
        }

        let open = self.handle(file)?;
        if !open.writable {
            return Err(MemFsError::ReadOnly);
        }
        let pos = open.pos;
        let path = open.path.clone();
        let data = self.files.get_mut(&path).ok_or(MemFsError::NotFound)?;
        if data.len() < pos + buf.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        self.handle_mut(file)?.pos = pos + buf.len();
        self.mutations += 1;
        Ok(buf.len())
    }

    fn sync(&mut self, file: MemFile) -> Result<(), MemFsError> {
        self.check(FsOp::Sync)?;
        self.handle(file)?;
        self.syncs += 1;
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), MemFsError> {
        self.check(FsOp::Remove)?;
        self.files.remove(path).ok_or(MemFsError::NotFound)?;
        self.mutations += 1;
        Ok(())
    }

    fn is_eof(&mut self, file: MemFile) -> Result<bool, MemFsError> {
        self.check(FsOp::Eof)?;
        let (pos, len) = self.len_of(file)?;
        Ok(pos >= len)
    }

    fn remaining(&mut self, file: MemFile) -> Result<u32, MemFsError> {
        self.check(FsOp::Remaining)?;
        let (pos, len) = self.len_of(file)?;
        Ok(len.saturating_sub(pos) as u32)
    }

    fn poll_media(&mut self) -> MediaStatus {
        if !self.media_present {
            return MediaStatus::Absent;
        }
        if self.media_changed {
            self.media_changed = false;
            return MediaStatus::Changed;
        }
        MediaStatus::Present
    }
}

/// Encodes `values` as a complete generation file.
pub fn generation_image(values: &[f32]) -> Vec<u8> {
    let mut image: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let crc = checksum(&image);
    image.extend_from_slice(&crc.to_le_bytes());
    image
}

/// Decodes the value slots of a generation file, ignoring the trailer.
pub fn image_values(image: &[u8]) -> Vec<f32> {
    let content = &image[..image.len().saturating_sub(4)];
    content
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualTicks {
    millis: Cell<u64>,
}

impl ManualTicks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, millis: u64) {
        self.millis.set(self.millis.get() + millis);
    }
}

impl TickSource for ManualTicks {
    fn now(&self) -> Instant {
        Instant::from_millis(self.millis.get())
    }
}

/// Exception sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub exceptions: Vec<PersistException>,
}

impl ExceptionSink for RecordingSink {
    fn report(&mut self, exception: PersistException) {
        self.exceptions.push(exception);
    }
}
