//! Exception reporting
//!
//! Conditions the operator has to see (a refused write, a corrupted settings
//! file, settings that could not be saved) are pushed through an
//! [`ExceptionSink`] instead of being swallowed as plain error returns.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::pubsub::ImmediatePublisher;
use log::{error, warn};

use crate::storage::generation::Generation;

/// Channel capacity for persistence exceptions
pub const EXCEPTION_CHANNEL_CAPACITY: usize = 4;

/// Number of subscribers (status reporter)
pub const EXCEPTION_SUBSCRIBERS: usize = 1;

/// Immediate publishers do not take a publisher slot
pub const EXCEPTION_PUBLISHERS: usize = 0;

/// Exceptions raised by the settings store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistException {
    /// A write or flush was attempted while the machine was moving
    Busy,
    /// A generation failed its checksum and was deleted
    CorruptGeneration(Generation),
    /// Pending values were discarded after repeated flush failures
    WritesDropped { entries: usize },
}

/// Destination for [`PersistException`]s.
pub trait ExceptionSink {
    fn report(&mut self, exception: PersistException);
}

impl<T: ExceptionSink + ?Sized> ExceptionSink for &mut T {
    fn report(&mut self, exception: PersistException) {
        (**self).report(exception);
    }
}

/// Sink that only writes exceptions to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExceptions;

impl ExceptionSink for LogExceptions {
    fn report(&mut self, exception: PersistException) {
        match exception {
            PersistException::Busy => warn!("Cannot persist settings while machine is moving"),
            PersistException::CorruptGeneration(generation) => {
                error!("Settings file {} was corrupt and has been removed", generation)
            }
            PersistException::WritesDropped { entries } => {
                error!("Gave up persisting {} pending settings", entries)
            }
        }
    }
}

/// Publishes onto an embassy pub-sub channel, overwriting the oldest message
/// when subscribers lag behind.
impl<M, const CAP: usize, const SUBS: usize, const PUBS: usize> ExceptionSink
    for ImmediatePublisher<'_, M, PersistException, CAP, SUBS, PUBS>
where
    M: RawMutex,
{
    fn report(&mut self, exception: PersistException) {
        self.publish_immediate(exception);
    }
}
