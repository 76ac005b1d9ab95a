use alloc::collections::TryReserveError;

pub type OneWireResult<T, E> = Result<T, OneWireError<E>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OneWireError<E> {
    /// The line was held low when a session was requested
    BusNotHigh,

    /// Driving or sampling the pin failed
    PinError(E),

    /// A session is still in flight, or its result has not been processed yet
    Busy,

    /// The output buffer has no room for a single byte
    EmptyBuffer,

    /// Every bit-slot of the session would be skipped
    SkipBitsOutOfRange,

    /// The interval scratch array could not be grown
    OutOfMemory,
}

impl<E> From<TryReserveError> for OneWireError<E> {
    fn from(_: TryReserveError) -> Self {
        OneWireError::OutOfMemory
    }
}
