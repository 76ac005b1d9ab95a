use alloc::collections::TryReserveError;
use alloc::vec::Vec;

/// Interval readings captured during one session, in microseconds.
///
/// The backing allocation only ever grows: a session needing more slots than
/// any previous one replaces it with an exactly-sized array, every other
/// session reuses it as is. Recording is bounded by the per-session `limit`.
#[derive(Debug, Default)]
pub struct Scratch {
    intervals: Vec<u32>,
    cursor: usize,
    limit: usize,
}

impl Scratch {
    pub const fn new() -> Self {
        Scratch {
            intervals: Vec::new(),
            cursor: 0,
            limit: 0,
        }
    }

    /// Number of interval slots currently allocated
    pub fn capacity(&self) -> usize {
        self.intervals.len()
    }

    /// Makes room for `required` slots. Returns `true` if the array was reallocated.
    pub fn ensure_capacity(&mut self, required: usize) -> Result<bool, TryReserveError> {
        if required <= self.intervals.len() {
            return Ok(false);
        }
        let mut intervals = Vec::new();
        intervals.try_reserve_exact(required)?;
        intervals.resize(required, 0);
        self.intervals = intervals;
        self.cursor = 0;
        self.limit = 0;
        Ok(true)
    }

    /// Starts a new session expecting `limit` slots.
    pub fn reset(&mut self, limit: usize) {
        debug_assert!(limit <= self.intervals.len());
        self.cursor = 0;
        self.limit = limit.min(self.intervals.len());
    }

    /// Stores one interval. Called from the edge interrupt: no allocation, and
    /// anything past the limit is dropped.
    #[inline]
    pub fn record(&mut self, interval: u32) {
        if self.cursor < self.limit {
            self.intervals[self.cursor] = interval;
            self.cursor += 1;
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.cursor >= self.limit
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Intervals recorded so far, in edge-arrival order
    pub fn captured(&self) -> &[u32] {
        &self.intervals[..self.cursor]
    }
}
