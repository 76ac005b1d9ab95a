use embassy_time::Duration;

/// Wake pulse for a DHT11: the line must be held low for at least 18 ms.
pub const DHT11_WAKE: Duration = Duration::from_millis(18);

/// Wake pulse for a DHT22 / AM2302: at least 1 ms low.
pub const DHT22_WAKE: Duration = Duration::from_millis(1);

/// The first falling edge ends the release period and the second ends the
/// 80 µs low / 80 µs high presence response, neither carries data.
pub const DHT_SKIP_BITS: usize = 2;

/// Humidity (2), temperature (2) and checksum (1).
pub const DHT_FRAME_BYTES: usize = 5;

/// Reference durations of the pulse-width code spoken on the line.
///
/// Each bit is a fixed `low` pulse followed by a high pulse whose length is
/// either close to `high_zero` or close to `high_one`. `timeout` bounds the
/// whole read phase, counted from the release of the wake pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    pub low: Duration,
    pub high_zero: Duration,
    pub high_one: Duration,
    pub timeout: Duration,
}

impl Timing {
    /// DHT11 / DHT22 / AM2302 family: 50 µs low, ~27 µs high for a zero and
    /// 70 µs high for a one. A full 42-slot frame takes under 6 ms.
    pub const DHT: Timing = Timing::new(
        Duration::from_micros(50),
        Duration::from_micros(27),
        Duration::from_micros(70),
        Duration::from_millis(10),
    );

    pub const fn new(
        low: Duration,
        high_zero: Duration,
        high_one: Duration,
        timeout: Duration,
    ) -> Self {
        Timing {
            low,
            high_zero,
            high_one,
            timeout,
        }
    }
}
