//! Rotating generation slots
//!
//! Every flush copies the current generation into the next slot and deletes
//! the old one once the copy is complete, so at least one whole generation
//! survives a power cut at any point of the rewrite. Three slots are enough
//! for this: one live, one being written, one free.

use core::fmt;

use log::trace;

use super::fs::BlockFilesystem;

/// Number of rotating generation slots
pub const GENERATION_COUNT: u8 = 3;

/// Directory holding the generation files
pub const PERSIST_DIR: &str = "persist";

const GENERATION_FILES: [&str; GENERATION_COUNT as usize] = [
    "persist/persist0.bin",
    "persist/persist1.bin",
    "persist/persist2.bin",
];

/// Index of one rotating generation slot, always `< GENERATION_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Generation(u8);

impl Generation {
    /// Slot used for an empty store and after every completed rotation.
    pub const FIRST: Self = Self(0);

    pub const fn new(slot: u8) -> Option<Self> {
        if slot < GENERATION_COUNT {
            Some(Self(slot))
        } else {
            None
        }
    }

    pub const fn slot(self) -> u8 {
        self.0
    }

    /// Slot the next flush writes into.
    pub const fn next(self) -> Self {
        Self((self.0 + 1) % GENERATION_COUNT)
    }

    /// Slot this generation superseded.
    pub const fn prev(self) -> Self {
        Self((self.0 + GENERATION_COUNT - 1) % GENERATION_COUNT)
    }

    pub const fn path(self) -> &'static str {
        GENERATION_FILES[self.0 as usize]
    }

    /// Iterates all slots in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..GENERATION_COUNT).map(Self)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Whether a generation's file exists. A failing stat counts as absent.
pub fn is_present<F: BlockFilesystem>(fs: &mut F, generation: Generation) -> bool {
    match fs.exists(generation.path()) {
        Ok(present) => present,
        Err(e) => {
            trace!("stat {} failed: {:?}", generation, e);
            false
        }
    }
}

/// Finds the slot holding the most recent generation.
///
/// The rotation never leaves more than two files behind, and when two
/// neighbouring slots survive the higher-numbered one is newer (slot 0 is
/// newer than slot 2 because the scan meets 0 first and 1 is absent).
/// Returns [`Generation::FIRST`] for an empty store.
pub fn resolve_active<F: BlockFilesystem>(fs: &mut F) -> Generation {
    for generation in Generation::all() {
        if is_present(fs, generation) {
            let next = generation.next();
            if next > generation && is_present(fs, next) {
                return next;
            }
            return generation;
        }
    }
    Generation::FIRST
}
