//! Power-loss tolerant settings persistence
//!
//! Stores the controller's `f32` settings either in byte-addressable
//! non-volatile memory or as rotating generation files on an SD card. The
//! file backend batches writes and rewrites a complete generation per
//! flush, so the last good set of values survives a power cut at any point.
//!
//! It is `#![no_std]` with `extern crate alloc` so it builds for the
//! controller and on desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod clock;
pub mod config;
pub mod error;
pub mod machine;
pub mod notify;
pub mod shared;
pub mod storage;

pub use config::StoreConfig;
pub use error::PersistError;
pub use storage::{Backend, FlushOutcome, SettingsBackend};
