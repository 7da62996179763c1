//! Injectable delay source.
//!
//! The bootloader handshakes wait for seconds at a time between attempts.
//! Routing every such wait through [`Delay`] keeps the state machine free of
//! wall-clock sleeps, so tests can drive it without real time passing.

use std::thread;
use std::time::Duration;

/// Blocking delay provider.
pub trait Delay {
    /// Block for `duration`.
    fn delay(&mut self, duration: Duration);
}

/// [`Delay`] backed by [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<D: Delay + ?Sized> Delay for &mut D {
    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration);
    }
}
