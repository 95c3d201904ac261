//! Store shared between the main loop and other tasks
//!
//! Accessors take `&self` so the store can live in a `static` and be
//! reached from a command parser running in another executor.
//!
//! The store sits behind embassy's async mutex. Its critical section only
//! covers taking and releasing the lock, so a flush holding the store for
//! several SD card writes never masks the motion interrupts. Tasks await
//! [`SharedStore::lock`]; interrupt handlers must only use the `&self`
//! accessors, which never wait and report [`PersistError::Busy`] when the
//! store is held elsewhere.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex as AsyncMutex, MutexGuard};
use log::warn;

use crate::error::PersistError;
use crate::storage::{FlushOutcome, SettingsBackend};

pub struct SharedStore<S> {
    inner: AsyncMutex<CriticalSectionRawMutex, S>,
}

impl<S> SharedStore<S> {
    pub const fn new(store: S) -> Self {
        Self {
            inner: AsyncMutex::new(store),
        }
    }

    /// Waits for exclusive access to the store.
    pub async fn lock(&self) -> MutexGuard<'_, CriticalSectionRawMutex, S> {
        self.inner.lock().await
    }

    /// Runs `f` with exclusive access to the store.
    ///
    /// Returns `None` without waiting if the store is already held, either
    /// by another task or further up the call stack.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        match self.inner.try_lock() {
            Ok(mut store) => Some(f(&mut store)),
            Err(_) => {
                warn!("Settings store is held elsewhere");
                None
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

impl<S: SettingsBackend> SharedStore<S> {
    pub fn read(&self, index: u32) -> Result<f32, PersistError> {
        self.with(|store| store.read(index))
            .unwrap_or(Err(PersistError::Busy))
    }

    pub fn write(&self, index: u32, value: f32) -> Result<(), PersistError> {
        self.with(|store| store.write(index, value))
            .unwrap_or(Err(PersistError::Busy))
    }

    pub fn flush_tick(&self) -> FlushOutcome {
        self.with(|store| store.flush_tick())
            .unwrap_or(FlushOutcome::Deferred)
    }
}
