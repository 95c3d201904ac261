use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Size in bytes of one persisted value slot.
pub const VALUE_LEN: usize = 4;

/// Tunables of the rotating-file store.
///
/// The defaults match what the controller ships with: a 512 byte I/O window,
/// at most one flush per second and three attempts before pending writes are
/// abandoned.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Bytes moved per read/write during CRC checks and flush windows
    pub io_buffer_size: usize,
    /// Minimum time between two flush attempts
    pub min_write_interval_ms: u64,
    /// Consecutive failed flushes after which the write cache is dropped
    pub max_write_failures: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            io_buffer_size: 512,
            min_write_interval_ms: 1000,
            max_write_failures: 3,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("I/O buffer of {0} bytes is not a non-zero multiple of the value size")]
    BufferSize(usize),
    #[error("failure budget must allow at least one attempt")]
    FailureBudget,
}

impl StoreConfig {
    pub const fn min_write_interval(&self) -> Duration {
        Duration::from_millis(self.min_write_interval_ms)
    }

    /// Number of value slots covered by one flush window.
    pub const fn window_slots(&self) -> usize {
        self.io_buffer_size / VALUE_LEN
    }

    /// Windows must hold whole slots so no value ever straddles two of them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_buffer_size == 0 || self.io_buffer_size % VALUE_LEN != 0 {
            return Err(ConfigError::BufferSize(self.io_buffer_size));
        }
        if self.max_write_failures == 0 {
            return Err(ConfigError::FailureBudget);
        }
        Ok(())
    }
}
