//! Settings storage backends
//!
//! Two media are supported behind [`SettingsBackend`]:
//! - [`NvmStore`]: byte-addressable memory (EEPROM, flash emulation) where a
//!   value is written in place
//! - [`RotatingFileStore`]: a FAT volume on a removable card, rewritten as
//!   whole generations with a CRC trailer so a power cut never loses the
//!   last good copy
//!
//! Values are `f32` slots addressed by index. Index `i` lives at byte offset
//! `i * 4` in the medium.

pub mod cache;
pub mod crc;
pub mod fs;
pub mod generation;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod nvm;
pub mod rotating;
pub mod sd_card;

pub use cache::WriteCache;
pub use fs::{BlockFilesystem, MediaStatus, OpenMode};
pub use generation::{GENERATION_COUNT, Generation, PERSIST_DIR};
pub use nvm::NvmStore;
pub use rotating::{FlushOutcome, RotatingFileStore};
pub use sd_card::{NoCardDetect, SdCardError, SdCardFilesystem};

use crate::error::PersistError;

/// Common interface of the settings media.
///
/// `flush_tick` is called from the controller's main loop; backends without
/// deferred writes report [`FlushOutcome::Idle`].
pub trait SettingsBackend {
    /// Reads the stored value of slot `index`.
    fn read(&mut self, index: u32) -> Result<f32, PersistError>;

    /// Requests that slot `index` hold `value`. Depending on the backend
    /// the value is durable on return or after a later flush.
    fn write(&mut self, index: u32, value: f32) -> Result<(), PersistError>;

    fn flush_tick(&mut self) -> FlushOutcome;
}

impl<T: SettingsBackend + ?Sized> SettingsBackend for &mut T {
    fn read(&mut self, index: u32) -> Result<f32, PersistError> {
        (**self).read(index)
    }

    fn write(&mut self, index: u32, value: f32) -> Result<(), PersistError> {
        (**self).write(index, value)
    }

    fn flush_tick(&mut self) -> FlushOutcome {
        (**self).flush_tick()
    }
}

/// Backend chosen at startup from the board's storage hardware.
pub enum Backend<N, R> {
    ByteAddressable(N),
    RotatingFile(R),
}

impl<N: SettingsBackend, R: SettingsBackend> SettingsBackend for Backend<N, R> {
    fn read(&mut self, index: u32) -> Result<f32, PersistError> {
        match self {
            Self::ByteAddressable(store) => store.read(index),
            Self::RotatingFile(store) => store.read(index),
        }
    }

    fn write(&mut self, index: u32, value: f32) -> Result<(), PersistError> {
        match self {
            Self::ByteAddressable(store) => store.write(index, value),
            Self::RotatingFile(store) => store.write(index, value),
        }
    }

    fn flush_tick(&mut self) -> FlushOutcome {
        match self {
            Self::ByteAddressable(store) => store.flush_tick(),
            Self::RotatingFile(store) => store.flush_tick(),
        }
    }
}
