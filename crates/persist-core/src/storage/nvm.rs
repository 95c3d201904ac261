//! Byte-addressable settings storage
//!
//! EEPROM and flash emulation layers can rewrite four bytes in place, so
//! there is nothing to batch: a changed value is written immediately.

use core::fmt::Debug;

use embedded_storage::Storage;
use log::debug;

use super::SettingsBackend;
use super::rotating::FlushOutcome;
use crate::config::VALUE_LEN;
use crate::error::PersistError;
use crate::machine::MotionState;
use crate::notify::{ExceptionSink, PersistException};

/// Settings stored as consecutive little-endian `f32`s starting at `base`.
pub struct NvmStore<S, M, X> {
    storage: S,
    base: u32,
    motion: M,
    exceptions: X,
}

impl<S, M, X> NvmStore<S, M, X>
where
    S: Storage,
    S::Error: Debug,
    M: MotionState,
    X: ExceptionSink,
{
    pub fn new(storage: S, base: u32, motion: M, exceptions: X) -> Self {
        Self {
            storage,
            base,
            motion,
            exceptions,
        }
    }

    pub fn exceptions(&self) -> &X {
        &self.exceptions
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    fn offset(&self, index: u32) -> Result<u32, PersistError> {
        let offset = index
            .checked_mul(VALUE_LEN as u32)
            .and_then(|bytes| bytes.checked_add(self.base))
            .ok_or(PersistError::OutOfRange(index))?;
        if offset as usize + VALUE_LEN > self.storage.capacity() {
            return Err(PersistError::OutOfRange(index));
        }
        Ok(offset)
    }

    pub fn read(&mut self, index: u32) -> Result<f32, PersistError> {
        let offset = self.offset(index)?;
        let mut bytes = [0u8; VALUE_LEN];
        self.storage.read(offset, &mut bytes).map_err(|e| {
            debug!("nvm read at {:#x} failed: {:?}", offset, e);
            PersistError::Storage
        })?;
        Ok(f32::from_le_bytes(bytes))
    }

    /// Writes `value` unless the slot already holds exactly these bits.
    /// NaN and infinite values are always written.
    pub fn write(&mut self, index: u32, value: f32) -> Result<(), PersistError> {
        let offset = self.offset(index)?;
        if self.motion.is_moving() {
            self.exceptions.report(PersistException::Busy);
            return Err(PersistError::Busy);
        }

        let unchanged = matches!(self.read(index), Ok(stored) if stored.to_bits() == value.to_bits());
        if unchanged && value.is_finite() {
            return Ok(());
        }

        self.storage
            .write(offset, &value.to_le_bytes())
            .map_err(|e| {
                debug!("nvm write at {:#x} failed: {:?}", offset, e);
                PersistError::Storage
            })
    }
}

impl<S, M, X> SettingsBackend for NvmStore<S, M, X>
where
    S: Storage,
    S::Error: Debug,
    M: MotionState,
    X: ExceptionSink,
{
    fn read(&mut self, index: u32) -> Result<f32, PersistError> {
        NvmStore::read(self, index)
    }

    fn write(&mut self, index: u32, value: f32) -> Result<(), PersistError> {
        NvmStore::write(self, index, value)
    }

    fn flush_tick(&mut self) -> FlushOutcome {
        FlushOutcome::Idle
    }
}
