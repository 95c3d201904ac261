use embassy_time::Instant;

/// Monotonic tick source used to rate-limit flushes.
pub trait TickSource {
    fn now(&self) -> Instant;
}

/// The embassy time driver's clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTicks;

impl TickSource for SystemTicks {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: TickSource + ?Sized> TickSource for &T {
    fn now(&self) -> Instant {
        (**self).now()
    }
}
