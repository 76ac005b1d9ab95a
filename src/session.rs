//! The wake-then-read session state machine.
//!
//! A session runs in three contexts:
//!
//! - [`Session::send`] from a task: validates the request, drives the line low
//!   and arms the wake timer.
//! - [`Session::on_timer`] and [`Session::on_falling_edge`] from interrupt
//!   handlers: release the line, time every falling edge and detect the end of
//!   the read phase. Both are allocation-free and run in bounded time.
//! - [`Session::process`] from a task again, after [`Defer::defer`]: decodes
//!   the captured intervals and hands the result to the completion callback.
//!
//! The edge interrupt and the timer are always disarmed before the deferral is
//! requested, so nothing in interrupt context touches the scratch array once
//! `process` may run.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::convert::TryFrom;
use core::fmt;

use embassy_time::{Duration, Instant};
use embedded_hal::digital::{InputPin, OutputPin};

use crate::classify;
use crate::error::{OneWireError, OneWireResult};
use crate::hal::{Clock, Defer, FallingEdge, OneShotTimer};
use crate::line::Line;
use crate::scratch::Scratch;
use crate::timing::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No session has been started yet
    Initialised,
    /// The wake pulse is being driven
    Writing,
    /// Falling edges are being timed
    Reading,
    /// Every expected bit-slot was captured
    BufferFull,
    /// The read phase ended before every bit-slot was captured
    TimeOut,
}

impl State {
    pub fn is_active(self) -> bool {
        matches!(self, State::Writing | State::Reading)
    }
}

/// How a session ended, as reported to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// Every expected bit-slot was captured
    Complete,
    /// The timeout expired first; bits past [`Reading::bits`] are zero
    TimedOut,
    /// The line could not be released after the wake pulse; nothing was captured
    LineFault,
}

/// The decoded result of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    /// The buffer passed to `send`, zero-filled then decoded MSB first
    pub data: Vec<u8>,
    pub outcome: Outcome,
    /// Number of payload bits captured, skipped slots excluded
    pub bits: usize,
}

pub(crate) type Callback = Box<dyn FnOnce(Reading) + Send>;

struct Transaction {
    output: Vec<u8>,
    on_complete: Callback,
    skip_bits: usize,
    line_fault: bool,
}

/// A finished session whose scratch array has been taken out of the
/// `Session` for decoding. `finish` must run, it delivers the callback and
/// hands the scratch array back for `Session::restore`.
pub(crate) struct Completed {
    transaction: Transaction,
    scratch: Scratch,
    timing: Timing,
    state: State,
}

impl Completed {
    #[cfg(test)]
    fn state(&self) -> State {
        self.state
    }

    pub(crate) fn finish(self) -> (Outcome, Scratch) {
        let Completed {
            transaction,
            scratch,
            timing,
            state,
        } = self;
        let Transaction {
            mut output,
            on_complete,
            skip_bits,
            line_fault,
        } = transaction;

        let bits = classify::decode(scratch.captured(), skip_bits, &timing, &mut output);
        let outcome = if line_fault {
            Outcome::LineFault
        } else if state == State::BufferFull {
            Outcome::Complete
        } else {
            Outcome::TimedOut
        };
        debug!("session finished: {} payload bits", bits);

        on_complete(Reading {
            data: output,
            outcome,
            bits,
        });
        (outcome, scratch)
    }
}

impl fmt::Debug for Completed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completed")
            .field("state", &self.state)
            .field("captured", &self.scratch.cursor())
            .finish()
    }
}

/// One pin plus one set of timing references, reused across many sessions.
pub struct Session<P, T, C, D> {
    line: Line<P>,
    timer: T,
    clock: C,
    defer: D,
    timing: Timing,
    state: State,
    // `None` while lent out to a `Completed`
    scratch: Option<Scratch>,
    last_edge: Instant,
    transaction: Option<Transaction>,
    max_slots: usize,
}

impl<P, T, C, D, E> Session<P, T, C, D>
where
    P: InputPin<Error = E>,
    P: OutputPin<Error = E>,
    P: FallingEdge,
    T: OneShotTimer,
    C: Clock,
    D: Defer,
{
    pub fn new(pin: P, timer: T, clock: C, defer: D, timing: Timing) -> OneWireResult<Self, E> {
        let line = Line::new(pin)?;
        let last_edge = clock.now();
        Ok(Session {
            line,
            timer,
            clock,
            defer,
            timing,
            state: State::Initialised,
            scratch: Some(Scratch::new()),
            last_edge,
            transaction: None,
            max_slots: usize::MAX,
        })
    }

    /// Caps the number of interval slots a single session may ask for, bounding
    /// the heap used by the scratch array. Larger requests fail with
    /// [`OneWireError::OutOfMemory`].
    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Interval slots currently allocated, or `None` while a result is being decoded
    pub fn scratch_capacity(&self) -> Option<usize> {
        self.scratch.as_ref().map(Scratch::capacity)
    }

    /// True from `send` until the result has been delivered
    pub fn is_busy(&self) -> bool {
        self.state.is_active() || self.transaction.is_some() || self.scratch.is_none()
    }

    pub fn into_inner(self) -> (P, T, C, D) {
        (self.line.into_inner(), self.timer, self.clock, self.defer)
    }

    /// Starts a session: holds the line low for `wake_low`, then times
    /// `skip_bits + 8 * buffer.len()` falling edges.
    ///
    /// Returns immediately. `on_complete` is called exactly once, from
    /// [`process`](Self::process), with `buffer` holding the decoded bits.
    /// On error no hardware activity has begun and no callback will run.
    pub fn send<F>(
        &mut self,
        wake_low: Duration,
        skip_bits: usize,
        mut buffer: Vec<u8>,
        on_complete: F,
    ) -> OneWireResult<(), E>
    where
        F: FnOnce(Reading) + Send + 'static,
    {
        buffer.fill(0);
        self.start(wake_low, skip_bits, buffer, Box::new(on_complete))
    }

    /// `send` with the output already zeroed and the callback boxed, so the
    /// O(n) preparation can happen outside a critical section.
    pub(crate) fn start(
        &mut self,
        wake_low: Duration,
        skip_bits: usize,
        output: Vec<u8>,
        on_complete: Callback,
    ) -> OneWireResult<(), E> {
        if self.is_busy() {
            warn!("send rejected, session in state {}", self.state);
            return Err(OneWireError::Busy);
        }
        if output.is_empty() {
            return Err(OneWireError::EmptyBuffer);
        }
        let slots = slots_for(skip_bits, output.len())?;
        if slots > self.max_slots {
            warn!("{} slots requested, limit is {}", slots, self.max_slots);
            return Err(OneWireError::OutOfMemory);
        }

        if !self.line.is_high()? {
            return Err(OneWireError::BusNotHigh);
        }

        let scratch = self.scratch.as_mut().ok_or(OneWireError::Busy)?;
        if scratch.ensure_capacity(slots)? {
            debug!("scratch grown to {} slots", slots);
        }
        scratch.reset(slots);

        self.line.drive_low()?;
        self.transaction = Some(Transaction {
            output,
            on_complete,
            skip_bits,
            line_fault: false,
        });
        self.state = State::Writing;
        self.timer.start(wake_low);
        trace!("wake pulse started, expecting {} slots", slots);
        Ok(())
    }

    /// Timer expiry. Ends the wake pulse, or the read phase on timeout.
    pub fn on_timer(&mut self) {
        match self.state {
            State::Writing => self.begin_reading(),
            State::Reading => {
                trace!("read timed out");
                self.complete(State::TimeOut);
            }
            _ => trace!("stale timer expiry in state {}", self.state),
        }
    }

    /// Falling edge on the line. Records the time since the previous edge.
    #[inline]
    pub fn on_falling_edge(&mut self) {
        if self.state != State::Reading {
            return;
        }
        let now = self.clock.now();
        let Some(scratch) = self.scratch.as_mut() else {
            return;
        };
        let elapsed = now.saturating_duration_since(self.last_edge).as_micros();
        self.last_edge = now;
        scratch.record(u32::try_from(elapsed).unwrap_or(u32::MAX));
        if scratch.is_full() {
            self.timer.cancel();
            self.complete(State::BufferFull);
        }
    }

    /// Decodes a finished session and runs its callback.
    ///
    /// Returns `None` when no finished session is waiting.
    pub fn process(&mut self) -> Option<Outcome> {
        let completed = self.take_completed()?;
        let (outcome, scratch) = completed.finish();
        self.restore(scratch);
        Some(outcome)
    }

    /// Takes a finished session out for decoding, leaving the session busy
    /// until `restore` is called.
    pub(crate) fn take_completed(&mut self) -> Option<Completed> {
        if !matches!(self.state, State::BufferFull | State::TimeOut) {
            return None;
        }
        let transaction = self.transaction.take()?;
        let scratch = match self.scratch.take() {
            Some(scratch) => scratch,
            None => {
                self.transaction = Some(transaction);
                return None;
            }
        };
        Some(Completed {
            transaction,
            scratch,
            timing: self.timing,
            state: self.state,
        })
    }

    /// Returns the scratch array taken by `take_completed`.
    pub(crate) fn restore(&mut self, scratch: Scratch) {
        let larger = self
            .scratch
            .as_ref()
            .map_or(true, |current| current.capacity() < scratch.capacity());
        if larger {
            self.scratch = Some(scratch);
        }
    }

    fn begin_reading(&mut self) {
        if self.line.release().is_err() {
            error!("failed to release the line after the wake pulse");
            if let Some(transaction) = self.transaction.as_mut() {
                transaction.line_fault = true;
            }
            self.complete(State::TimeOut);
            return;
        }
        self.last_edge = self.clock.now();
        self.state = State::Reading;
        self.line.listen_falling();
        self.timer.start(self.timing.timeout);
    }

    fn complete(&mut self, state: State) {
        self.line.unlisten();
        self.state = state;
        self.defer.defer();
    }
}

/// Bit-slots needed for `skip_bits` leading slots and `len` output bytes.
fn slots_for<E>(skip_bits: usize, len: usize) -> OneWireResult<usize, E> {
    let payload_bits = len.checked_mul(8).ok_or(OneWireError::OutOfMemory)?;
    if skip_bits >= payload_bits {
        return Err(OneWireError::SkipBitsOutOfRange);
    }
    skip_bits
        .checked_add(payload_bits)
        .ok_or(OneWireError::OutOfMemory)
}

impl<P, T, C, D> fmt::Debug for Session<P, T, C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("timing", &self.timing)
            .field("scratch", &self.scratch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::digital::{ErrorKind, ErrorType};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Probe {
        low: bool,
        held_low: bool,
        fail_release: bool,
        listening: bool,
        timer: Option<Duration>,
        now: u64,
        deferred: usize,
    }

    type Shared = Arc<Mutex<Probe>>;

    struct FakePin(Shared);
    struct FakeTimer(Shared);
    struct FakeClock(Shared);
    struct FakeDefer(Shared);

    impl ErrorType for FakePin {
        type Error = ErrorKind;
    }

    impl OutputPin for FakePin {
        fn set_low(&mut self) -> Result<(), ErrorKind> {
            self.0.lock().unwrap().low = true;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), ErrorKind> {
            let mut probe = self.0.lock().unwrap();
            if probe.fail_release {
                return Err(ErrorKind::Other);
            }
            probe.low = false;
            Ok(())
        }
    }

    impl InputPin for FakePin {
        fn is_high(&mut self) -> Result<bool, ErrorKind> {
            let probe = self.0.lock().unwrap();
            Ok(!probe.low && !probe.held_low)
        }

        fn is_low(&mut self) -> Result<bool, ErrorKind> {
            self.is_high().map(|high| !high)
        }
    }

    impl FallingEdge for FakePin {
        fn listen_falling(&mut self) {
            self.0.lock().unwrap().listening = true;
        }

        fn unlisten(&mut self) {
            self.0.lock().unwrap().listening = false;
        }
    }

    impl OneShotTimer for FakeTimer {
        fn start(&mut self, after: Duration) {
            self.0.lock().unwrap().timer = Some(after);
        }

        fn cancel(&mut self) {
            self.0.lock().unwrap().timer = None;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            Instant::from_micros(self.0.lock().unwrap().now)
        }
    }

    impl Defer for FakeDefer {
        fn defer(&mut self) {
            self.0.lock().unwrap().deferred += 1;
        }
    }

    type TestSession = Session<FakePin, FakeTimer, FakeClock, FakeDefer>;

    const REFERENCE_FRAME: [u32; 10] = [77, 77, 77, 113, 120, 77, 77, 120, 77, 77];

    fn session() -> (TestSession, Shared) {
        let probe = Shared::default();
        let session = Session::new(
            FakePin(probe.clone()),
            FakeTimer(probe.clone()),
            FakeClock(probe.clone()),
            FakeDefer(probe.clone()),
            Timing::DHT,
        )
        .unwrap();
        (session, probe)
    }

    fn collector() -> (Arc<Mutex<Vec<Reading>>>, impl FnOnce(Reading) + Send + 'static) {
        let readings = Arc::new(Mutex::new(Vec::new()));
        let sink = readings.clone();
        (readings, move |reading| sink.lock().unwrap().push(reading))
    }

    fn wake(session: &mut TestSession, probe: &Shared) {
        probe.lock().unwrap().now += 18_000;
        session.on_timer();
    }

    fn edges(session: &mut TestSession, probe: &Shared, intervals: &[u32]) {
        for &interval in intervals {
            probe.lock().unwrap().now += u64::from(interval);
            session.on_falling_edge();
        }
    }

    fn send(session: &mut TestSession, skip_bits: usize, len: usize) -> Arc<Mutex<Vec<Reading>>> {
        let (readings, on_complete) = collector();
        session
            .send(Duration::from_millis(18), skip_bits, vec![0xff; len], on_complete)
            .unwrap();
        readings
    }

    #[test]
    fn decodes_reference_frame() {
        let (mut session, probe) = session();
        assert_eq!(session.state(), State::Initialised);

        let readings = send(&mut session, 2, 1);
        {
            let p = probe.lock().unwrap();
            assert!(p.low);
            assert_eq!(p.timer, Some(Duration::from_millis(18)));
        }
        assert_eq!(session.state(), State::Writing);

        wake(&mut session, &probe);
        {
            let p = probe.lock().unwrap();
            assert!(!p.low);
            assert!(p.listening);
            assert_eq!(p.timer, Some(Timing::DHT.timeout));
        }
        assert_eq!(session.state(), State::Reading);

        edges(&mut session, &probe, &REFERENCE_FRAME);
        assert_eq!(session.state(), State::BufferFull);
        {
            let p = probe.lock().unwrap();
            assert!(!p.listening);
            assert_eq!(p.timer, None);
            assert_eq!(p.deferred, 1);
        }
        assert!(readings.lock().unwrap().is_empty());

        assert_eq!(session.process(), Some(Outcome::Complete));
        let readings = readings.lock().unwrap();
        assert_eq!(
            *readings,
            vec![Reading {
                data: vec![0x64],
                outcome: Outcome::Complete,
                bits: 8,
            }]
        );
    }

    #[test]
    fn edges_after_buffer_full_are_ignored() {
        let (mut session, probe) = session();
        let readings = send(&mut session, 2, 1);
        wake(&mut session, &probe);
        edges(&mut session, &probe, &REFERENCE_FRAME);
        edges(&mut session, &probe, &[120, 120, 120]);
        session.on_timer();

        assert_eq!(session.state(), State::BufferFull);
        assert_eq!(probe.lock().unwrap().deferred, 1);
        session.process();
        assert_eq!(readings.lock().unwrap()[0].data, vec![0x64]);
    }

    #[test]
    fn timeout_keeps_partial_result() {
        let (mut session, probe) = session();
        let readings = send(&mut session, 2, 2);
        wake(&mut session, &probe);
        edges(&mut session, &probe, &[77, 77, 120, 120, 120]);
        assert_eq!(session.state(), State::Reading);

        session.on_timer();
        assert_eq!(session.state(), State::TimeOut);
        assert!(!probe.lock().unwrap().listening);
        assert_eq!(probe.lock().unwrap().deferred, 1);

        assert_eq!(session.process(), Some(Outcome::TimedOut));
        let readings = readings.lock().unwrap();
        assert_eq!(readings[0].data, vec![0xe0, 0x00]);
        assert_eq!(readings[0].bits, 3);
    }

    #[test]
    fn timeout_without_edges() {
        let (mut session, probe) = session();
        let readings = send(&mut session, 2, 5);
        wake(&mut session, &probe);
        session.on_timer();

        assert_eq!(session.process(), Some(Outcome::TimedOut));
        let readings = readings.lock().unwrap();
        assert_eq!(readings[0].data, vec![0; 5]);
        assert_eq!(readings[0].bits, 0);
    }

    #[test]
    fn scratch_capacity_is_sticky() {
        let (mut session, probe) = session();
        assert_eq!(session.scratch_capacity(), Some(0));

        for (len, expected) in [(5, 42), (5, 42), (2, 42), (6, 50), (1, 50)] {
            send(&mut session, 2, len);
            assert_eq!(session.scratch_capacity(), Some(expected));
            wake(&mut session, &probe);
            session.on_timer();
            session.process().unwrap();
        }
    }

    #[test]
    fn second_send_is_rejected_while_in_flight() {
        let (mut session, probe) = session();
        let readings = send(&mut session, 2, 1);

        let (rejected, on_complete) = collector();
        let err = session.send(Duration::from_millis(1), 0, vec![0xaa; 4], on_complete);
        assert_eq!(err, Err(OneWireError::Busy));

        wake(&mut session, &probe);
        edges(&mut session, &probe, &REFERENCE_FRAME[..4]);
        let (_, on_complete) = collector();
        assert_eq!(
            session.send(Duration::from_millis(1), 0, vec![0; 4], on_complete),
            Err(OneWireError::Busy)
        );
        assert_eq!(session.state(), State::Reading);
        assert_eq!(probe.lock().unwrap().timer, Some(Timing::DHT.timeout));

        edges(&mut session, &probe, &REFERENCE_FRAME[4..]);
        let (_, on_complete) = collector();
        assert_eq!(
            session.send(Duration::from_millis(1), 0, vec![0; 4], on_complete),
            Err(OneWireError::Busy)
        );

        session.process();
        assert_eq!(readings.lock().unwrap()[0].data, vec![0x64]);
        assert!(rejected.lock().unwrap().is_empty());
        assert_eq!(session.scratch_capacity(), Some(10));

        send(&mut session, 0, 1);
        assert_eq!(session.state(), State::Writing);
    }

    #[test]
    fn invalid_requests_leave_line_alone() {
        let (mut session, probe) = session();

        let (_, on_complete) = collector();
        assert_eq!(
            session.send(Duration::from_millis(1), 0, Vec::new(), on_complete),
            Err(OneWireError::EmptyBuffer)
        );
        let (_, on_complete) = collector();
        assert_eq!(
            session.send(Duration::from_millis(1), 8, vec![0], on_complete),
            Err(OneWireError::SkipBitsOutOfRange)
        );

        probe.lock().unwrap().held_low = true;
        let (_, on_complete) = collector();
        assert_eq!(
            session.send(Duration::from_millis(1), 2, vec![0], on_complete),
            Err(OneWireError::BusNotHigh)
        );

        let p = probe.lock().unwrap();
        assert!(!p.low);
        assert_eq!(p.timer, None);
        drop(p);
        assert_eq!(session.state(), State::Initialised);
        assert!(!session.is_busy());
    }

    #[test]
    fn stray_interrupts_are_ignored() {
        let (mut session, probe) = session();
        session.on_timer();
        session.on_falling_edge();
        assert_eq!(session.state(), State::Initialised);

        let readings = send(&mut session, 2, 1);
        edges(&mut session, &probe, &[77, 77, 77]);
        assert_eq!(session.state(), State::Writing);

        wake(&mut session, &probe);
        edges(&mut session, &probe, &REFERENCE_FRAME);
        session.process();
        assert_eq!(readings.lock().unwrap()[0].data, vec![0x64]);
        assert_eq!(probe.lock().unwrap().deferred, 1);
    }

    #[test]
    fn release_failure_is_reported() {
        let (mut session, probe) = session();
        let readings = send(&mut session, 2, 1);
        probe.lock().unwrap().fail_release = true;
        wake(&mut session, &probe);

        assert_eq!(session.state(), State::TimeOut);
        assert!(!probe.lock().unwrap().listening);
        assert_eq!(probe.lock().unwrap().deferred, 1);
        assert_eq!(session.process(), Some(Outcome::LineFault));
        assert_eq!(readings.lock().unwrap()[0].bits, 0);
    }

    #[test]
    fn callback_runs_exactly_once() {
        let (mut session, probe) = session();
        assert_eq!(session.process(), None);

        let readings = send(&mut session, 2, 1);
        assert_eq!(session.process(), None);
        wake(&mut session, &probe);
        edges(&mut session, &probe, &REFERENCE_FRAME);

        assert_eq!(session.process(), Some(Outcome::Complete));
        assert_eq!(session.process(), None);
        assert_eq!(readings.lock().unwrap().len(), 1);
        assert!(!session.is_busy());
    }

    #[test]
    fn slot_limit_rejects_before_driving_the_line() {
        let (session, probe) = session();
        let mut session = session.with_max_slots(16);

        let (readings, on_complete) = collector();
        assert_eq!(
            session.send(Duration::from_millis(18), 2, vec![0xff; 2], on_complete),
            Err(OneWireError::OutOfMemory)
        );
        {
            let p = probe.lock().unwrap();
            assert!(!p.low);
            assert_eq!(p.timer, None);
        }
        assert_eq!(session.state(), State::Initialised);
        assert_eq!(session.scratch_capacity(), Some(0));
        assert!(!session.is_busy());
        assert!(readings.lock().unwrap().is_empty());

        send(&mut session, 2, 1);
        assert_eq!(session.scratch_capacity(), Some(10));
    }

    #[test]
    fn slot_count_overflow() {
        assert_eq!(slots_for::<()>(2, 5), Ok(42));
        assert_eq!(slots_for::<()>(0, usize::MAX), Err(OneWireError::OutOfMemory));
        assert_eq!(
            slots_for::<()>(usize::MAX - 8, usize::MAX / 8),
            Err(OneWireError::OutOfMemory)
        );
        assert_eq!(slots_for::<()>(8, 1), Err(OneWireError::SkipBitsOutOfRange));
    }

    #[test]
    fn lent_scratch_blocks_send() {
        let (mut session, probe) = session();
        send(&mut session, 2, 1);
        wake(&mut session, &probe);
        edges(&mut session, &probe, &REFERENCE_FRAME);

        let completed = session.take_completed().unwrap();
        assert_eq!(completed.state(), State::BufferFull);
        assert!(session.take_completed().is_none());
        assert!(session.is_busy());
        assert_eq!(session.scratch_capacity(), None);
        let (_, on_complete) = collector();
        assert_eq!(
            session.send(Duration::from_millis(1), 2, vec![0], on_complete),
            Err(OneWireError::Busy)
        );

        let (outcome, scratch) = completed.finish();
        assert_eq!(outcome, Outcome::Complete);
        session.restore(scratch);
        assert_eq!(session.scratch_capacity(), Some(10));
        assert!(!session.is_busy());
    }
}
