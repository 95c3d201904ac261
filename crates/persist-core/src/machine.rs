//! Motion-state gate
//!
//! Disk I/O stalls the realtime planner, so the store refuses writes and
//! flushes while any motion cycle is active.

use core::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the machine is currently executing a motion cycle.
pub trait MotionState {
    fn is_moving(&self) -> bool;
}

/// Flag kept up to date by the motion planner (or its interrupt handler).
impl MotionState for AtomicBool {
    fn is_moving(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<T: MotionState + ?Sized> MotionState for &T {
    fn is_moving(&self) -> bool {
        (**self).is_moving()
    }
}

/// Cycle state of the canonical machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Off,
    Machining,
    Probe,
    Homing,
    Jog,
}

impl MotionState for CycleState {
    fn is_moving(&self) -> bool {
        *self != CycleState::Off
    }
}
