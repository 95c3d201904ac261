//! Pending writes waiting for the next flush

use alloc::collections::BTreeMap;
use alloc::collections::btree_map;
use core::ops::Range;

/// Value changes accepted by the accessors but not yet durable.
///
/// Ordered by slot index so the flush engine can pull one window's entries
/// at a time while streaming the new generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteCache {
    entries: BTreeMap<u32, f32>,
}

impl WriteCache {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Stages `value` for `index`, replacing any earlier pending value.
    pub fn insert(&mut self, index: u32, value: f32) {
        self.entries.insert(index, value);
    }

    /// Withdraws a pending value, returning it if there was one.
    pub fn remove(&mut self, index: u32) -> Option<f32> {
        self.entries.remove(&index)
    }

    pub fn get(&self, index: u32) -> Option<f32> {
        self.entries.get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> btree_map::Iter<'_, u32, f32> {
        self.entries.iter()
    }

    /// Highest slot index with a pending value inside `window`.
    pub fn last_in(&self, window: Range<u32>) -> Option<u32> {
        self.entries.range(window).next_back().map(|(&index, _)| index)
    }

    /// Whether any pending value lies at or beyond `index`.
    pub fn has_from(&self, index: u32) -> bool {
        self.entries.range(index..).next().is_some()
    }

    /// Removes and yields every entry inside `window`, lowest index first.
    pub fn drain_window(&mut self, window: Range<u32>) -> btree_map::IntoIter<u32, f32> {
        let mut tail = self.entries.split_off(&window.start);
        let mut rest = tail.split_off(&window.end);
        self.entries.append(&mut rest);
        tail.into_iter()
    }
}
