//! Nearest-neighbour decoding of captured intervals into bits.
//!
//! Every interval is forced into one of the two buckets; there is no rejection
//! band. Validating the decoded payload (usually a checksum) is up to the caller.

use crate::timing::Timing;

/// Returns the bit encoded by one low+high interval.
///
/// The fixed low phase is subtracted first, then the remaining high phase is
/// compared against both references. A tie decodes as `0`.
pub fn classify(interval_us: u32, timing: &Timing) -> bool {
    let high = i64::from(interval_us) - micros(timing.low);
    let zero_distance = (high - micros(timing.high_zero)).abs();
    let one_distance = (high - micros(timing.high_one)).abs();
    one_distance < zero_distance
}

/// Decodes `intervals[skip_bits..]` into `output`, most significant bit first.
///
/// Only ones are written, so `output` is expected to be zeroed beforehand.
/// Intervals that do not fit in `output` are ignored. Returns the number of
/// payload bits decoded.
pub fn decode(intervals: &[u32], skip_bits: usize, timing: &Timing, output: &mut [u8]) -> usize {
    let payload = intervals.get(skip_bits..).unwrap_or(&[]);
    let payload = &payload[..payload.len().min(output.len() * 8)];
    for (index, &interval) in payload.iter().enumerate() {
        if classify(interval, timing) {
            output[index / 8] |= 0x80 >> (index % 8);
        }
    }
    payload.len()
}

fn micros(duration: embassy_time::Duration) -> i64 {
    duration.as_micros() as i64
}
