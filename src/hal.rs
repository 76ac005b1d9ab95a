//! Hardware capabilities the session is driven by, beyond the `embedded-hal`
//! digital pin traits.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};

/// Falling-edge interrupt on the session's pin.
///
/// The platform's interrupt handler is expected to call
/// [`Session::on_falling_edge`](crate::Session::on_falling_edge) while enabled.
pub trait FallingEdge {
    fn listen_falling(&mut self);
    fn unlisten(&mut self);
}

/// A cancellable one-shot timer. On expiry the platform calls
/// [`Session::on_timer`](crate::Session::on_timer).
pub trait OneShotTimer {
    /// Arms the timer, replacing any pending expiry
    fn start(&mut self, after: Duration);
    fn cancel(&mut self);
}

/// Monotonic clock read from interrupt context.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Reads the embassy time driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Requests that [`Session::process`](crate::Session::process) be run soon,
/// outside interrupt context. Called from interrupt context, once per session.
pub trait Defer {
    fn defer(&mut self);
}

/// No notification; the application polls `process` itself.
impl Defer for () {
    fn defer(&mut self) {}
}

/// Wakes a task waiting on the signal, which then calls `process`.
impl<'a, M: RawMutex> Defer for &'a Signal<M, ()> {
    fn defer(&mut self) {
        self.signal(());
    }
}
