//! Generation rewrite and flush scheduling
//!
//! A flush streams the current generation through the I/O buffer one window
//! at a time, overlays the cached values that fall in each window and writes
//! the result to the next slot, followed by the CRC of everything written.
//! Only after the new file is closed is the old one deleted, so a power cut
//! at any point leaves at least one valid generation behind.
//!
//! ```text
//!   persist0.bin  [ v0 v1 v2 ... vN | crc ]      baseline
//!                    |  |  |       |
//!   cache            .  x  .   y   .             pending writes
//!                    v  v  v   v   v
//!   persist1.bin  [ v0 x  v2 . y . vN | crc' ]   next generation
//! ```

use log::{debug, error, info, warn};

use super::RotatingFileStore;
use crate::clock::TickSource;
use crate::config::VALUE_LEN;
use crate::error::{FsOp, PersistError, io};
use crate::machine::MotionState;
use crate::notify::{ExceptionSink, PersistException};
use crate::storage::crc::{CRC_LEN, RunningCrc};
use crate::storage::fs::{BlockFilesystem, MediaStatus, OpenMode};
use crate::storage::generation::{GENERATION_COUNT, Generation, is_present};

/// What one call of the flush scheduler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Idle,
    /// The previous attempt was too recent
    RateLimited,
    /// The machine is moving; pending values are kept for later
    Deferred,
    /// A new generation was committed
    Flushed { entries: usize },
    /// The attempt failed and pending values are kept for a retry
    Failed { failures: u8 },
    /// Too many consecutive failures; pending values were discarded
    Dropped { entries: usize },
}

impl FlushOutcome {
    /// Whether the call attempted to write the medium.
    pub fn attempted(&self) -> bool {
        matches!(
            self,
            Self::Flushed { .. } | Self::Failed { .. } | Self::Dropped { .. }
        )
    }
}

impl<F, M, C, X> RotatingFileStore<F, M, C, X>
where
    F: BlockFilesystem,
    M: MotionState,
    C: TickSource,
    X: ExceptionSink,
{
    /// Main-loop hook. Flushes the write cache when something is pending,
    /// the machine is idle and the minimum interval has passed.
    ///
    /// A flush held back by motion reports [`PersistException::Busy`] once
    /// until the machine stops again.
    ///
    /// A failed flush keeps the cache for the next attempt. After
    /// `max_write_failures` consecutive failures the cache is dropped and
    /// [`PersistException::WritesDropped`] is reported.
    pub fn flush_tick(&mut self) -> FlushOutcome {
        match self.fs.poll_media() {
            MediaStatus::Present => {}
            status => {
                if self.active.is_some() {
                    info!("Settings card {:?}, releasing open generation", status);
                }
                self.release_active();
            }
        }

        if self.cache.is_empty() {
            return FlushOutcome::Idle;
        }
        let now = self.clock.now();
        if now.saturating_duration_since(self.last_flush) < self.config.min_write_interval() {
            return FlushOutcome::RateLimited;
        }
        if self.motion.is_moving() {
            if !self.deferral_reported {
                self.exceptions.report(PersistException::Busy);
                self.deferral_reported = true;
            }
            return FlushOutcome::Deferred;
        }
        self.deferral_reported = false;

        let entries = self.cache.len();
        let outcome = match self.write_generation() {
            Ok(_) => {
                self.cache.clear();
                self.failures = 0;
                FlushOutcome::Flushed { entries }
            }
            Err(e) => {
                warn!("Settings flush failed: {}", e);
                self.discard_in_flight();
                self.failures = self.failures.saturating_add(1);

                if self.failures >= self.config.max_write_failures {
                    error!(
                        "Dropping {} pending settings after {} failed flushes",
                        entries, self.failures
                    );
                    self.cache.clear();
                    self.failures = 0;
                    self.exceptions
                        .report(PersistException::WritesDropped { entries });
                    FlushOutcome::Dropped { entries }
                } else {
                    FlushOutcome::Failed {
                        failures: self.failures,
                    }
                }
            }
        };

        self.last_flush = self.clock.now();
        outcome
    }

    /// Flushes immediately, ignoring the rate limit and the failure budget.
    ///
    /// Meant for an orderly shutdown. Returns the number of values written;
    /// on failure the cache is kept.
    pub fn flush_now(&mut self) -> Result<usize, PersistError> {
        if self.cache.is_empty() {
            return Ok(0);
        }

        match self.write_generation() {
            Ok(entries) => {
                self.cache.clear();
                self.failures = 0;
                self.last_flush = self.clock.now();
                Ok(entries)
            }
            Err(e) => {
                self.discard_in_flight();
                Err(e)
            }
        }
    }

    /// Writes the next generation from the current one plus the cache.
    ///
    /// Does not clear the cache and does not clean up after a failure; a
    /// partially written file is left in the slot recorded in `in_flight`.
    pub(crate) fn write_generation(&mut self) -> Result<usize, PersistError> {
        self.refuse_while_moving()?;

        let baseline = self.open_baseline()?;
        let current = match baseline {
            Some(_) => self.generation,
            None => Generation::FIRST,
        };
        let next = current.next();
        self.remove_stray(current, next)?;

        let out = self
            .fs
            .open(next.path(), OpenMode::CreateTruncate)
            .map_err(io(FsOp::Open))?;
        self.in_flight = Some(next);
        debug!("writing {} from {:?}", next, baseline.map(|_| current));

        let entries = match self.merge_into(baseline, out) {
            Ok(entries) => entries,
            Err(e) => {
                self.close_quietly(out);
                return Err(e);
            }
        };
        self.fs.close(out).map_err(io(FsOp::Close))?;

        if let Some(old) = baseline {
            self.active = None;
            self.fs.close(old).map_err(io(FsOp::Close))?;
            self.fs.remove(current.path()).map_err(io(FsOp::Remove))?;
        }

        self.generation = Generation::FIRST;
        self.in_flight = None;
        info!("Persisted {} settings to {}", entries, next);
        Ok(entries)
    }

    /// Opens the current generation, retrying past corrupt ones.
    ///
    /// `None` means the store holds no generation and the flush starts from
    /// an empty baseline.
    fn open_baseline(&mut self) -> Result<Option<F::File>, PersistError> {
        for _ in 0..GENERATION_COUNT {
            match self.prepare() {
                Ok(file) => {
                    self.fs.seek(file, 0).map_err(io(FsOp::Seek))?;
                    return Ok(Some(file));
                }
                Err(PersistError::NoGeneration) => return Ok(None),
                Err(PersistError::Integrity(generation)) => {
                    warn!("Skipping corrupt {} as flush baseline", generation);
                }
                Err(e) => return Err(e),
            }
        }
        // Every slot failed its checksum and was deleted
        Ok(None)
    }

    /// Keeps at most two generations on the medium: the one being read and
    /// the one being written.
    fn remove_stray(&mut self, current: Generation, next: Generation) -> Result<(), PersistError> {
        let stray = next.next();
        if stray != current && is_present(&mut self.fs, stray) {
            warn!("Removing stray {} before rotation", stray);
            self.fs.remove(stray.path()).map_err(io(FsOp::Remove))?;
        }
        Ok(())
    }

    /// Streams baseline and cache into `out` and appends the trailer.
    /// Returns the number of cache entries merged.
    fn merge_into(&mut self, baseline: Option<F::File>, out: F::File) -> Result<usize, PersistError> {
        // Commit the directory entry before any data
        self.fs.sync(out).map_err(io(FsOp::Sync))?;

        let window_len = self.config.io_buffer_size;
        let step = self.config.window_slots() as u32;
        let mut pending = self.cache.clone();
        let entries = pending.len();

        let mut baseline_left = match baseline {
            Some(file) => {
                let remaining = self.fs.remaining(file).map_err(io(FsOp::Remaining))?;
                (remaining as usize).saturating_sub(CRC_LEN)
            }
            None => 0,
        };

        let mut crc = RunningCrc::new();
        let mut start: u32 = 0;

        while baseline_left > 0 || !pending.is_empty() {
            let end = start.saturating_add(step);
            let from_baseline = baseline_left.min(window_len);

            // Full windows while anything follows, otherwise just up to the
            // last byte that exists in either source
            let len = if baseline_left > window_len || pending.has_from(end) {
                window_len
            } else {
                let cached = pending
                    .last_in(start..end)
                    .map_or(0, |last| (last - start + 1) as usize * VALUE_LEN);
                from_baseline.max(cached)
            };

            if let Some(file) = baseline.filter(|_| from_baseline > 0) {
                let read = self
                    .fs
                    .read(file, &mut self.io_buffer[..from_baseline])
                    .map_err(io(FsOp::Read))?;
                if read != from_baseline {
                    return Err(PersistError::ShortRead {
                        expected: from_baseline,
                        actual: read,
                    });
                }
            }
            self.io_buffer[from_baseline..len].fill(0);
            baseline_left -= from_baseline;

            for (index, value) in pending.drain_window(start..end) {
                let at = (index - start) as usize * VALUE_LEN;
                self.io_buffer[at..at + VALUE_LEN].copy_from_slice(&value.to_le_bytes());
            }

            let window = &self.io_buffer[..len];
            let written = self.fs.write(out, window).map_err(io(FsOp::Write))?;
            if written != len {
                return Err(PersistError::ShortWrite {
                    expected: len,
                    actual: written,
                });
            }
            self.fs.sync(out).map_err(io(FsOp::Sync))?;
            crc.update(window);

            start = end;
        }

        let trailer = crc.finalize().to_le_bytes();
        let written = self.fs.write(out, &trailer).map_err(io(FsOp::Write))?;
        if written != CRC_LEN {
            return Err(PersistError::ShortWrite {
                expected: CRC_LEN,
                actual: written,
            });
        }
        Ok(entries)
    }

    /// Deletes the partial file of a failed flush.
    fn discard_in_flight(&mut self) {
        if let Some(generation) = self.in_flight.take() {
            match self.fs.remove(generation.path()) {
                Ok(()) => debug!("removed partial {}", generation),
                Err(e) => debug!("could not remove partial {}: {:?}", generation, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Rig;
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::crc::checksum;
    use crate::storage::mock::{MemFs, generation_image, image_values};
    use alloc::vec::Vec;
    use core::sync::atomic::Ordering;

    const GEN0: &str = "persist/persist0.bin";
    const GEN1: &str = "persist/persist1.bin";
    const GEN2: &str = "persist/persist2.bin";

    fn fs_with(path: &str, values: &[f32]) -> MemFs {
        let mut fs = MemFs::new();
        fs.insert_file(path, &generation_image(values));
        fs
    }

    fn ramp(count: usize) -> Vec<f32> {
        (0..count).map(|i| i as f32 + 1.0).collect()
    }

    fn assert_valid(fs: &MemFs, path: &str) {
        let image = fs.file(path).unwrap();
        let (content, trailer) = image.split_at(image.len() - CRC_LEN);
        assert_eq!(
            u32::from_le_bytes(trailer.try_into().unwrap()),
            checksum(content),
            "{} has a bad trailer",
            path
        );
    }

    #[test]
    fn test_first_flush_creates_generation() {
        let rig = Rig::default();
        let mut store = rig.store(MemFs::new());

        store.write(3, 1.5).unwrap();
        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Flushed { entries: 1 });

        assert!(store.cache().is_empty());
        assert_eq!(store.fs().paths(), [GEN1]);
        assert_valid(store.fs(), GEN1);
        assert_eq!(image_values(store.fs().file(GEN1).unwrap()), [0.0, 0.0, 0.0, 1.5]);
        assert_eq!(store.read(3), Ok(1.5));
        assert_eq!(store.read(0), Ok(0.0));
    }

    #[test]
    fn test_windowed_merge_over_baseline() {
        let rig = Rig::default();
        let baseline = ramp(100);
        let mut store = rig.store(fs_with(GEN0, &baseline));

        store.write(5, 5.5).unwrap();
        store.write(150, 150.5).unwrap();
        assert_eq!(store.flush_now(), Ok(2));

        assert_eq!(store.fs().paths(), [GEN1]);
        let image = store.fs().file(GEN1).unwrap();
        assert_eq!(image.len(), 151 * 4 + CRC_LEN);
        assert_valid(store.fs(), GEN1);

        let values = image_values(image);
        for (i, &value) in values.iter().enumerate() {
            let expected = match i {
                5 => 5.5,
                150 => 150.5,
                0..100 => baseline[i],
                _ => 0.0,
            };
            assert_eq!(value, expected, "slot {}", i);
        }
    }

    #[test]
    fn test_small_windows_match_single_window() {
        let baseline = ramp(23);
        let mut images = Vec::new();

        for io_buffer_size in [4, 8, 16, 512] {
            let rig = Rig::default();
            let config = StoreConfig {
                io_buffer_size,
                ..StoreConfig::default()
            };
            let mut store = rig.store_with(fs_with(GEN2, &baseline), config);
            store.write(0, -1.0).unwrap();
            store.write(7, -7.0).unwrap();
            store.write(30, -30.0).unwrap();
            assert_eq!(store.flush_now(), Ok(3));

            assert_eq!(store.fs().paths(), [GEN0]);
            images.push(store.into_filesystem().file(GEN0).unwrap().to_vec());
        }

        assert!(images.windows(2).all(|pair| pair[0] == pair[1]));
        let values = image_values(&images[0]);
        assert_eq!(values.len(), 31);
        assert_eq!(values[0], -1.0);
        assert_eq!(values[7], -7.0);
        assert_eq!(values[22], 23.0);
        assert_eq!(values[23], 0.0);
        assert_eq!(values[30], -30.0);
    }

    #[test]
    fn test_cache_inside_baseline_keeps_length() {
        let rig = Rig::default();
        let config = StoreConfig {
            io_buffer_size: 8,
            ..StoreConfig::default()
        };
        let mut store = rig.store_with(fs_with(GEN0, &ramp(5)), config);

        store.write(1, 0.25).unwrap();
        store.flush_now().unwrap();

        let image = store.fs().file(GEN1).unwrap();
        assert_eq!(image_values(image), [1.0, 0.25, 3.0, 4.0, 5.0]);
        assert_valid(store.fs(), GEN1);
    }

    #[test]
    fn test_rotation_cycles_through_slots() {
        let rig = Rig::default();
        let mut store = rig.store(MemFs::new());

        for (round, expected) in [GEN1, GEN2, GEN0, GEN1].into_iter().enumerate() {
            store.write(0, round as f32 + 10.0).unwrap();
            assert_eq!(store.flush_now(), Ok(1));
            assert_eq!(store.fs().paths(), [expected]);
            assert_eq!(store.read(0), Ok(round as f32 + 10.0));
        }
    }

    #[test]
    fn test_unchanged_write_leaves_file_untouched() {
        let rig = Rig::default();
        let image = generation_image(&[1.0, 2.0]);
        let mut fs = MemFs::new();
        fs.insert_file(GEN0, &image);
        let mut store = rig.store(fs);

        store.write(1, 2.0).unwrap();
        rig.ticks.advance_ms(5000);
        assert_eq!(store.flush_tick(), FlushOutcome::Idle);
        assert_eq!(store.fs().paths(), [GEN0]);
        assert_eq!(store.fs().file(GEN0), Some(&image[..]));
        assert_eq!(store.fs().mutations(), 0);
    }

    #[test]
    fn test_rate_limit_allows_one_flush_per_interval() {
        let rig = Rig::default();
        let mut store = rig.store(MemFs::new());

        store.write(0, 1.0).unwrap();
        assert_eq!(store.flush_tick(), FlushOutcome::RateLimited);
        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Flushed { entries: 1 });

        store.write(0, 2.0).unwrap();
        rig.ticks.advance_ms(200);
        assert_eq!(store.flush_tick(), FlushOutcome::RateLimited);
        rig.ticks.advance_ms(799);
        assert_eq!(store.flush_tick(), FlushOutcome::RateLimited);
        rig.ticks.advance_ms(1);
        assert_eq!(store.flush_tick(), FlushOutcome::Flushed { entries: 1 });
        assert_eq!(store.read(0), Ok(2.0));
    }

    #[test]
    fn test_flush_deferred_while_moving() {
        let rig = Rig::default();
        let mut store = rig.store(MemFs::new());
        store.write(4, 1.0).unwrap();
        rig.ticks.advance_ms(1000);

        rig.moving.store(true, Ordering::Release);
        let mutations = store.fs().mutations();
        assert_eq!(store.flush_tick(), FlushOutcome::Deferred);
        assert_eq!(store.flush_tick(), FlushOutcome::Deferred);
        assert_eq!(store.fs().mutations(), mutations);
        assert_eq!(store.cache().len(), 1);
        assert_eq!(store.exceptions().exceptions, [PersistException::Busy]);

        rig.moving.store(false, Ordering::Release);
        assert_eq!(store.flush_tick(), FlushOutcome::Flushed { entries: 1 });
    }

    #[test]
    fn test_busy_reported_once_per_motion() {
        let rig = Rig::default();
        let mut store = rig.store(MemFs::new());
        store.write(0, 1.0).unwrap();
        rig.ticks.advance_ms(1000);

        rig.moving.store(true, Ordering::Release);
        for _ in 0..3 {
            assert_eq!(store.flush_tick(), FlushOutcome::Deferred);
        }
        rig.moving.store(false, Ordering::Release);
        store.fs_mut().fail_next(FsOp::Open);
        assert_eq!(store.flush_tick(), FlushOutcome::Failed { failures: 1 });

        rig.moving.store(true, Ordering::Release);
        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Deferred);
        assert_eq!(
            store.exceptions().exceptions,
            [PersistException::Busy, PersistException::Busy]
        );
    }

    #[test]
    fn test_flush_syncs_after_create_and_every_window() {
        let rig = Rig::default();
        let config = StoreConfig {
            io_buffer_size: 8,
            ..StoreConfig::default()
        };
        let mut store = rig.store_with(fs_with(GEN0, &ramp(4)), config);

        // Slot 5 extends the file to three two-slot windows
        store.write(5, 0.5).unwrap();
        let syncs = store.fs().syncs();
        assert_eq!(store.flush_now(), Ok(1));

        assert_eq!(store.fs().syncs() - syncs, 1 + 3);
        assert_eq!(
            image_values(store.fs().file(GEN1).unwrap()),
            [1.0, 2.0, 3.0, 4.0, 0.0, 0.5]
        );
    }

    #[test]
    fn test_failed_sync_aborts_flush() {
        let rig = Rig::default();
        let baseline = generation_image(&ramp(4));
        let mut fs = MemFs::new();
        fs.insert_file(GEN0, &baseline);
        let mut store = rig.store(fs);

        store.write(1, 0.5).unwrap();
        store.fs_mut().fail_next(FsOp::Sync);
        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Failed { failures: 1 });

        assert_eq!(store.fs().paths(), [GEN0]);
        assert_eq!(store.fs().file(GEN0), Some(&baseline[..]));
        assert_eq!(store.cache().get(1), Some(0.5));
    }

    #[test]
    fn test_flush_now_refused_while_moving() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(GEN0, &[1.0]));
        store.write(0, 2.0).unwrap();
        let mutations = store.fs().mutations();

        rig.moving.store(true, Ordering::Release);
        assert_eq!(store.flush_now(), Err(PersistError::Busy));
        assert_eq!(store.fs().mutations(), mutations);
        assert_eq!(store.exceptions().exceptions, [PersistException::Busy]);
        assert_eq!(store.cache().len(), 1);
    }

    #[test]
    fn test_failed_flush_keeps_baseline_and_cache() {
        let rig = Rig::default();
        let config = StoreConfig {
            io_buffer_size: 8,
            ..StoreConfig::default()
        };
        let baseline = generation_image(&ramp(10));
        let mut fs = MemFs::new();
        fs.insert_file(GEN0, &baseline);
        let mut store = rig.store_with(fs, config);

        store.write(2, 0.5).unwrap();
        store.fs_mut().cut_power_after_writes(2);
        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Failed { failures: 1 });

        assert_eq!(store.fs().paths(), [GEN0]);
        assert_eq!(store.fs().file(GEN0), Some(&baseline[..]));
        assert_eq!(store.cache().get(2), Some(0.5));
        assert_eq!(store.failures(), 1);
        assert_eq!(store.fs().open_handles(), 1);

        store.fs_mut().restore_power();
        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Flushed { entries: 1 });
        assert_eq!(store.failures(), 0);
        assert_eq!(store.read(2), Ok(0.5));
        assert_eq!(store.read(9), Ok(10.0));
    }

    #[test]
    fn test_failure_budget_drops_cache() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(GEN0, &[1.0, 2.0]));
        store.write(0, 9.0).unwrap();
        store.write(1, 8.0).unwrap();
        store.fs_mut().cut_power_after_writes(0);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            rig.ticks.advance_ms(1000);
            outcomes.push(store.flush_tick());
        }

        assert_eq!(
            outcomes,
            [
                FlushOutcome::Failed { failures: 1 },
                FlushOutcome::Failed { failures: 2 },
                FlushOutcome::Dropped { entries: 2 },
            ]
        );
        assert!(store.cache().is_empty());
        assert_eq!(store.failures(), 0);
        assert_eq!(
            store.exceptions().exceptions,
            [PersistException::WritesDropped { entries: 2 }]
        );
        assert_eq!(store.fs().paths(), [GEN0]);
        assert_eq!(store.read(0), Ok(1.0));

        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Idle);
    }

    #[test]
    fn test_crash_before_old_generation_deleted() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(GEN0, &[1.0, 2.0]));
        store.write(1, 3.0).unwrap();

        store.fs_mut().fail_next(FsOp::Remove);
        assert_eq!(
            store.write_generation(),
            Err(PersistError::Io(FsOp::Remove))
        );
        // Reboot without cleanup
        let fs = store.into_filesystem();
        assert_valid(&fs, GEN0);
        assert_valid(&fs, GEN1);

        let mut store = rig.store(fs);
        assert_eq!(store.read(1), Ok(3.0));
        assert_eq!(store.fs().paths(), [GEN1]);
    }

    #[test]
    fn test_crash_mid_write_recovers_previous_generation() {
        let rig = Rig::default();
        let config = StoreConfig {
            io_buffer_size: 4,
            ..StoreConfig::default()
        };
        let mut store = rig.store_with(fs_with(GEN1, &ramp(6)), config);
        store.write(5, 0.0).unwrap();

        store.fs_mut().cut_power_after_writes(3);
        assert!(matches!(
            store.write_generation(),
            Err(PersistError::Io(FsOp::Write))
        ));
        let mut fs = store.into_filesystem();
        fs.restore_power();
        assert_eq!(fs.paths(), [GEN1, GEN2]);

        // The partial file looks newer and is rejected on first access
        let mut store = rig.store_with(fs, config);
        let partial = Generation::new(2).unwrap();
        assert_eq!(store.read(0), Err(PersistError::Integrity(partial)));
        assert_eq!(store.read(5), Ok(6.0));
        assert_eq!(store.fs().paths(), [GEN1]);
    }

    #[test]
    fn test_flush_after_crash_merges_surviving_generation() {
        let rig = Rig::default();
        let mut fs = fs_with(GEN1, &ramp(4));
        fs.insert_file(GEN2, &[0xde, 0xad]);
        let mut store = rig.store(fs);

        store.write(9, 0.5).unwrap();
        assert_eq!(store.flush_now(), Ok(1));

        assert_eq!(store.fs().paths(), [GEN2]);
        assert_valid(store.fs(), GEN2);
        let values = image_values(store.fs().file(GEN2).unwrap());
        assert_eq!(&values[..4], &ramp(4)[..]);
        assert_eq!(values[9], 0.5);
    }

    #[test]
    fn test_stray_generation_removed_before_rotation() {
        let rig = Rig::default();
        let mut fs = fs_with(GEN0, &[1.0]);
        fs.insert_file(GEN1, &generation_image(&[2.0]));
        let mut store = rig.store(fs);

        // Superseded slot 0 survives validation of slot 1
        store.fs_mut().fail_next(FsOp::Remove);
        assert_eq!(store.read(0), Ok(2.0));
        assert_eq!(store.fs().paths(), [GEN0, GEN1]);

        store.write(0, 3.0).unwrap();
        assert_eq!(store.flush_now(), Ok(1));
        assert_eq!(store.fs().paths(), [GEN2]);
        assert_eq!(store.read(0), Ok(3.0));
    }

    #[test]
    fn test_flush_resets_to_unresolved_generation() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(GEN0, &[1.0]));
        store.write(0, 2.0).unwrap();
        store.flush_now().unwrap();

        assert!(store.active.is_none());
        assert_eq!(store.generation, Generation::FIRST);
        assert_eq!(store.fs().open_handles(), 0);
    }

    #[test]
    fn test_media_change_releases_handle() {
        let rig = Rig::default();
        let mut store = rig.store(fs_with(GEN0, &[1.0]));
        assert_eq!(store.read(0), Ok(1.0));

        store.fs_mut().remove_media();
        assert_eq!(store.flush_tick(), FlushOutcome::Idle);
        assert!(store.active.is_none());

        store.write(0, 2.0).unwrap();
        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Failed { failures: 1 });

        store.fs_mut().insert_media();
        rig.ticks.advance_ms(1000);
        assert_eq!(store.flush_tick(), FlushOutcome::Flushed { entries: 1 });
        assert_eq!(store.read(0), Ok(2.0));
    }

    #[test]
    fn test_flush_now_without_pending_is_noop() {
        let rig = Rig::default();
        let mut store = rig.store(MemFs::new());
        assert_eq!(store.flush_now(), Ok(0));
        assert_eq!(store.fs().mutations(), 0);
        assert!(!FlushOutcome::Idle.attempted());
    }
}
