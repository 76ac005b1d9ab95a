use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::RefCell;

use critical_section::Mutex;
use embassy_time::Duration;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::error::{OneWireError, OneWireResult};
use crate::hal::{Clock, Defer, FallingEdge, OneShotTimer};
use crate::session::{Callback, Outcome, Reading, Session, State};

/// A [`Session`] reachable from both interrupt handlers and tasks, meant to live
/// in a `static`.
///
/// Interrupt entry points take the critical section for a bounded, allocation-free
/// handler. [`process`](Self::process) only holds it long enough to take the
/// captured intervals out and to put them back; decoding and the completion
/// callback run with interrupts enabled.
///
/// ```ignore
/// static DHT: SharedSession<Pin, Timer, EmbassyClock, &'static DoneSignal> = SharedSession::new();
/// static DONE: DoneSignal = Signal::new();
///
/// #[interrupt]
/// fn GPIO() { DHT.on_falling_edge() }
///
/// #[interrupt]
/// fn TIMER() { DHT.on_timer() }
///
/// #[embassy_executor::task]
/// async fn dht_task() {
///     loop {
///         DONE.wait().await;
///         DHT.process();
///     }
/// }
/// ```
pub struct SharedSession<P, T, C, D> {
    inner: Mutex<RefCell<Option<Session<P, T, C, D>>>>,
}

impl<P, T, C, D> SharedSession<P, T, C, D> {
    pub const fn new() -> Self {
        SharedSession {
            inner: Mutex::new(RefCell::new(None)),
        }
    }
}

impl<P, T, C, D> Default for SharedSession<P, T, C, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, T, C, D, E> SharedSession<P, T, C, D>
where
    P: InputPin<Error = E>,
    P: OutputPin<Error = E>,
    P: FallingEdge,
    T: OneShotTimer,
    C: Clock,
    D: Defer,
{
    /// Installs the session, returning the previous one if any
    pub fn install(&self, session: Session<P, T, C, D>) -> Option<Session<P, T, C, D>> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).replace(session))
    }

    pub fn take(&self) -> Option<Session<P, T, C, D>> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).take())
    }

    /// `None` until a session is installed
    pub fn state(&self) -> Option<State> {
        critical_section::with(|cs| self.inner.borrow_ref(cs).as_ref().map(Session::state))
    }

    /// See [`Session::send`]. Returns [`OneWireError::Busy`] if nothing is installed.
    ///
    /// The buffer is zeroed and the callback boxed before entering the critical
    /// section. Growing the scratch array, when a session needs more slots than
    /// any before it, still happens inside.
    pub fn send<F>(
        &self,
        wake_low: Duration,
        skip_bits: usize,
        mut buffer: Vec<u8>,
        on_complete: F,
    ) -> OneWireResult<(), E>
    where
        F: FnOnce(Reading) + Send + 'static,
    {
        buffer.fill(0);
        let on_complete: Callback = Box::new(on_complete);
        critical_section::with(|cs| match self.inner.borrow_ref_mut(cs).as_mut() {
            Some(session) => session.start(wake_low, skip_bits, buffer, on_complete),
            None => Err(OneWireError::Busy),
        })
    }

    /// Call from the timer interrupt handler
    pub fn on_timer(&self) {
        critical_section::with(|cs| {
            if let Some(session) = self.inner.borrow_ref_mut(cs).as_mut() {
                session.on_timer();
            }
        });
    }

    /// Call from the falling-edge interrupt handler
    pub fn on_falling_edge(&self) {
        critical_section::with(|cs| {
            if let Some(session) = self.inner.borrow_ref_mut(cs).as_mut() {
                session.on_falling_edge();
            }
        });
    }

    /// Call from task context once deferred. See [`Session::process`].
    pub fn process(&self) -> Option<Outcome> {
        let completed = critical_section::with(|cs| {
            self.inner
                .borrow_ref_mut(cs)
                .as_mut()
                .and_then(Session::take_completed)
        })?;
        let (outcome, scratch) = completed.finish();
        critical_section::with(|cs| {
            if let Some(session) = self.inner.borrow_ref_mut(cs).as_mut() {
                session.restore(scratch);
            }
        });
        Some(outcome)
    }
}
