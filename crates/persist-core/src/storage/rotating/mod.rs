//! Rotating-file settings store
//!
//! Reads go straight to the current generation file. Writes only land in a
//! [`WriteCache`]; [`RotatingFileStore::flush_tick`] later merges the cache
//! with the current generation into the next slot (see [`flush`]).
//!
//! The store keeps one validated read handle open between calls. It is
//! dropped when the card is swapped, when a flush rotates generations, or
//! when the handle stops validating.

mod flush;

pub use flush::FlushOutcome;

use alloc::vec;
use alloc::vec::Vec;

use embassy_time::Instant;
use log::{debug, info, warn};

use super::cache::WriteCache;
use super::crc::{CRC_LEN, verify_checksum};
use super::fs::{BlockFilesystem, OpenMode};
use super::generation::{Generation, PERSIST_DIR, is_present, resolve_active};
use super::SettingsBackend;
use crate::clock::TickSource;
use crate::config::{ConfigError, StoreConfig, VALUE_LEN};
use crate::error::{FsOp, PersistError, io};
use crate::machine::MotionState;
use crate::notify::{ExceptionSink, PersistException};

/// Highest slot index whose bytes fit in a file.
pub const MAX_INDEX: u32 = u32::MAX / VALUE_LEN as u32 - 1;

pub struct RotatingFileStore<F, M, C, X>
where
    F: BlockFilesystem,
{
    fs: F,
    motion: M,
    clock: C,
    exceptions: X,
    config: StoreConfig,
    /// Generation `active` was opened from; `FIRST` while unresolved
    generation: Generation,
    active: Option<F::File>,
    /// Slot written by the flush currently in progress
    in_flight: Option<Generation>,
    last_flush: Instant,
    /// Busy already reported for the current stretch of motion
    deferral_reported: bool,
    failures: u8,
    cache: WriteCache,
    io_buffer: Vec<u8>,
}

impl<F, M, C, X> RotatingFileStore<F, M, C, X>
where
    F: BlockFilesystem,
    M: MotionState,
    C: TickSource,
    X: ExceptionSink,
{
    /// Creates the store. Nothing touches the medium until the first access.
    pub fn new(
        fs: F,
        motion: M,
        clock: C,
        exceptions: X,
        config: StoreConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let last_flush = clock.now();

        Ok(Self {
            fs,
            motion,
            clock,
            exceptions,
            config,
            generation: Generation::FIRST,
            active: None,
            in_flight: None,
            last_flush,
            deferral_reported: false,
            failures: 0,
            cache: WriteCache::new(),
            io_buffer: vec![0; config.io_buffer_size],
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Values accepted but not yet flushed.
    pub fn cache(&self) -> &WriteCache {
        &self.cache
    }

    /// Consecutive failed flush attempts.
    pub fn failures(&self) -> u8 {
        self.failures
    }

    pub fn exceptions(&self) -> &X {
        &self.exceptions
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    /// Closes the open handle and hands the filesystem back. Pending cache
    /// entries are lost.
    pub fn into_filesystem(mut self) -> F {
        self.release_active();
        self.fs
    }

    /// Reads slot `index` from the current generation.
    ///
    /// Pending cache entries are not consulted: the result is what a reboot
    /// would see.
    pub fn read(&mut self, index: u32) -> Result<f32, PersistError> {
        if index > MAX_INDEX {
            return Err(PersistError::OutOfRange(index));
        }
        let file = self.prepare()?;

        self.fs
            .seek(file, index * VALUE_LEN as u32)
            .map_err(io(FsOp::Seek))?;
        let remaining = self.fs.remaining(file).map_err(io(FsOp::Remaining))? as usize;
        // The slot must lie entirely before the trailer
        if remaining < VALUE_LEN + CRC_LEN {
            return Err(PersistError::ShortRead {
                expected: VALUE_LEN,
                actual: remaining.saturating_sub(CRC_LEN),
            });
        }

        let mut bytes = [0u8; VALUE_LEN];
        let read = self.fs.read(file, &mut bytes).map_err(io(FsOp::Read))?;
        if read != VALUE_LEN {
            return Err(PersistError::ShortRead {
                expected: VALUE_LEN,
                actual: read,
            });
        }
        Ok(f32::from_le_bytes(bytes))
    }

    /// Stages `value` for slot `index`.
    ///
    /// A value identical to the stored one is not staged, and any pending
    /// change of that slot is withdrawn. Slots that cannot be read back, and
    /// NaN or infinite values, are always staged.
    pub fn write(&mut self, index: u32, value: f32) -> Result<(), PersistError> {
        if index > MAX_INDEX {
            return Err(PersistError::OutOfRange(index));
        }
        self.refuse_while_moving()?;

        let changed = match self.read(index) {
            Ok(stored) => stored.to_bits() != value.to_bits(),
            Err(e) => {
                debug!("slot {} not readable ({}), staging write", index, e);
                true
            }
        };

        if changed || !value.is_finite() {
            self.cache.insert(index, value);
        } else if self.cache.remove(index).is_some() {
            debug!("slot {} back to its stored value", index);
        }
        Ok(())
    }

    fn refuse_while_moving(&mut self) -> Result<(), PersistError> {
        if self.motion.is_moving() {
            self.exceptions.report(PersistException::Busy);
            return Err(PersistError::Busy);
        }
        Ok(())
    }

    /// Returns a validated handle on the current generation, opening and
    /// checking one if needed.
    ///
    /// A generation that fails its checksum is deleted and reported, and
    /// the call fails with [`PersistError::Integrity`]; the next call then
    /// resolves whatever older generation is left. Once a generation
    /// validates, the one it superseded is deleted.
    pub(crate) fn prepare(&mut self) -> Result<F::File, PersistError> {
        if let Some(file) = self.active {
            match self.fs.validate(file) {
                Ok(()) => return Ok(file),
                Err(e) => {
                    debug!("handle on {} went stale: {:?}", self.generation, e);
                    self.release_active();
                }
            }
        }

        if !self.fs.is_mounted() {
            self.fs.mount().map_err(io(FsOp::Mount))?;
            info!("Mounted settings volume");
        }
        if let Err(e) = self.fs.make_dir(PERSIST_DIR) {
            debug!("mkdir {} failed: {:?}", PERSIST_DIR, e);
        }

        let generation = resolve_active(&mut self.fs);
        if !is_present(&mut self.fs, generation) {
            return Err(PersistError::NoGeneration);
        }

        let file = self
            .fs
            .open(generation.path(), OpenMode::Read)
            .map_err(io(FsOp::Open))?;
        let valid = match verify_checksum(&mut self.fs, file, &mut self.io_buffer) {
            Ok(valid) => valid,
            Err(e) => {
                self.close_quietly(file);
                return Err(e);
            }
        };

        if !valid {
            warn!("Checksum mismatch in {}, deleting it", generation);
            self.close_quietly(file);
            if let Err(e) = self.fs.remove(generation.path()) {
                warn!("Could not delete {}: {:?}", generation, e);
            }
            self.exceptions
                .report(PersistException::CorruptGeneration(generation));
            return Err(PersistError::Integrity(generation));
        }

        let superseded = generation.prev();
        if is_present(&mut self.fs, superseded) {
            match self.fs.remove(superseded.path()) {
                Ok(()) => debug!("deleted superseded {}", superseded),
                Err(e) => debug!("could not delete superseded {}: {:?}", superseded, e),
            }
        }

        debug!("using {}", generation);
        self.generation = generation;
        self.active = Some(file);
        Ok(file)
    }

    fn release_active(&mut self) {
        if let Some(file) = self.active.take() {
            self.close_quietly(file);
        }
        self.generation = Generation::FIRST;
    }

    fn close_quietly(&mut self, file: F::File) {
        if let Err(e) = self.fs.close(file) {
            debug!("close failed: {:?}", e);
        }
    }
}

impl<F, M, C, X> SettingsBackend for RotatingFileStore<F, M, C, X>
where
    F: BlockFilesystem,
    M: MotionState,
    C: TickSource,
    X: ExceptionSink,
{
    fn read(&mut self, index: u32) -> Result<f32, PersistError> {
        RotatingFileStore::read(self, index)
    }

    fn write(&mut self, index: u32, value: f32) -> Result<(), PersistError> {
        RotatingFileStore::write(self, index, value)
    }

    fn flush_tick(&mut self) -> FlushOutcome {
        RotatingFileStore::flush_tick(self)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Rig;
    use super::*;
    use crate::storage::mock::{MemFs, generation_image};
    use core::sync::atomic::Ordering;

    fn fs_with(generations: &[(u8, &[f32])]) -> MemFs {
        let mut fs = MemFs::new();
        for &(slot, values) in generations {
            let generation = Generation::new(slot).unwrap();
            fs.insert_file(generation.path(), &generation_image(values));
        }
        fs
    }

    #[test]
    fn test_rejects_invalid_config() {
        let rig = Rig::default();
        let config = StoreConfig {
            io_buffer_size: 6,
            ..StoreConfig::default()
        };
        let store = RotatingFileStore::new(
            MemFs::new(),
            &rig.moving,
            &rig.ticks,
            crate::notify::LogExceptions,
            config,
        );
        assert!(matches!(store, Err(ConfigError::BufferSize(6))));
    }

    #[test]
    fn test_read_current_generation() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(1, &[0.5, 1.5, 2.5])]));

        assert_eq!(store.read(2), Ok(2.5));
        assert_eq!(store.read(0), Ok(0.5));
        assert_eq!(store.fs().mounts(), 1);
        assert_eq!(store.fs().open_handles(), 1);
    }

    #[test]
    fn test_read_past_content_is_short() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(0, &[1.0, 2.0])]));

        assert!(matches!(store.read(2), Err(PersistError::ShortRead { .. })));
        assert!(matches!(store.read(500), Err(PersistError::ShortRead { .. })));
        assert_eq!(store.read(1), Ok(2.0));
    }

    #[test]
    fn test_empty_store_has_no_generation() {
        let rig = Rig::default();
        let mut store = rig.store(MemFs::new());

        assert_eq!(store.read(0), Err(PersistError::NoGeneration));
        assert_eq!(store.fs().open_handles(), 0);
    }

    #[test]
    fn test_corrupt_generation_is_deleted_and_reported() {
        let rig = Rig::default();
        let mut fs = fs_with(&[(1, &[1.0, 2.0])]);
        fs.flip_bit(Generation::new(1).unwrap().path(), 5, 0);
        let mut store = rig.store(fs);

        let corrupt = Generation::new(1).unwrap();
        assert_eq!(store.read(0), Err(PersistError::Integrity(corrupt)));
        assert!(!store.fs().contains(corrupt.path()));
        assert_eq!(
            store.exceptions().exceptions,
            [PersistException::CorruptGeneration(corrupt)]
        );
        assert_eq!(store.fs().open_handles(), 0);
        assert_eq!(store.read(0), Err(PersistError::NoGeneration));
    }

    #[test]
    fn test_falls_back_to_older_generation_after_corruption() {
        let rig = Rig::default();
        let mut fs = fs_with(&[(0, &[1.0]), (1, &[2.0])]);
        fs.flip_bit(Generation::new(1).unwrap().path(), 0, 7);
        let mut store = rig.store(fs);

        assert!(matches!(store.read(0), Err(PersistError::Integrity(_))));
        assert_eq!(store.read(0), Ok(1.0));
    }

    #[test]
    fn test_validated_generation_deletes_superseded() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(0, &[1.0]), (1, &[2.0])]));

        assert_eq!(store.read(0), Ok(2.0));
        assert_eq!(store.fs().paths(), ["persist/persist1.bin"]);
    }

    #[test]
    fn test_io_error_during_validation_keeps_file() {
        let rig = Rig::default();
        let mut fs = fs_with(&[(2, &[1.0])]);
        fs.fail_next(FsOp::Read);
        let mut store = rig.store(fs);

        assert_eq!(store.read(0), Err(PersistError::Io(FsOp::Read)));
        assert!(store.fs().contains("persist/persist2.bin"));
        assert_eq!(store.fs().open_handles(), 0);
        assert_eq!(store.read(0), Ok(1.0));
    }

    #[test]
    fn test_remounts_after_media_swap() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(0, &[4.0])]));
        assert_eq!(store.read(0), Ok(4.0));

        store.fs_mut().remove_media();
        assert_eq!(store.read(0), Err(PersistError::Io(FsOp::Mount)));
        store.fs_mut().insert_media();
        assert_eq!(store.read(0), Ok(4.0));
        assert_eq!(store.fs().mounts(), 2);
    }

    #[test]
    fn test_unchanged_write_is_not_staged() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(0, &[1.0, 2.0])]));

        store.write(1, 2.0).unwrap();
        assert!(store.cache().is_empty());
    }

    #[test]
    fn test_changed_write_is_staged_not_stored() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(0, &[1.0, 2.0])]));
        let before = store.fs().mutations();

        store.write(1, 3.0).unwrap();
        assert_eq!(store.cache().get(1), Some(3.0));
        assert_eq!(store.read(1), Ok(2.0));
        assert_eq!(store.fs().mutations(), before);
    }

    #[test]
    fn test_write_back_to_stored_value_withdraws_pending() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(0, &[1.0])]));

        store.write(0, 7.0).unwrap();
        store.write(0, 1.0).unwrap();
        assert!(store.cache().is_empty());
    }

    #[test]
    fn test_unreadable_slot_and_non_finite_values_are_staged() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(0, &[f32::NAN, f32::INFINITY])]));

        store.write(0, f32::NAN).unwrap();
        store.write(1, f32::INFINITY).unwrap();
        store.write(9, 0.0).unwrap();
        assert_eq!(store.cache().len(), 3);

        let mut empty = rig.store(MemFs::new());
        empty.write(0, 0.0).unwrap();
        assert_eq!(empty.cache().get(0), Some(0.0));
    }

    #[test]
    fn test_write_refused_while_moving() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(&[(0, &[1.0])]));
        rig.moving.store(true, Ordering::Release);

        assert_eq!(store.write(0, 2.0), Err(PersistError::Busy));
        assert!(store.cache().is_empty());
        assert_eq!(store.fs().mutations(), 0);
        assert_eq!(store.exceptions().exceptions, [PersistException::Busy]);
    }

    #[test]
    fn test_index_out_of_range() {
        let rig = Rig::default();
        let mut store = rig.store(MemFs::new());

        assert_eq!(
            store.write(u32::MAX, 1.0),
            Err(PersistError::OutOfRange(u32::MAX))
        );
        assert_eq!(
            store.read(MAX_INDEX + 1),
            Err(PersistError::OutOfRange(MAX_INDEX + 1))
        );
    }
}
