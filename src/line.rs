use embedded_hal::digital::{InputPin, OutputPin};

use crate::error::{OneWireError, OneWireResult};
use crate::hal::FallingEdge;

/// The single shared data line: driven low for the wake pulse, then released to
/// the pull-up and used as a falling-edge input while the device answers.
pub struct Line<P> {
    pin: P,
}

impl<P, E> Line<P>
where
    P: InputPin<Error = E>,
    P: OutputPin<Error = E>,
    P: FallingEdge,
{
    pub fn new(pin: P) -> OneWireResult<Line<P>, E> {
        let mut line = Line { pin };
        // Line should be high during idle.
        line.pin.unlisten();
        line.release()?;
        Ok(line)
    }

    pub fn into_inner(self) -> P {
        self.pin
    }

    /// Stops driving the line, letting the device (or the pull-up resistor) set its value
    pub fn release(&mut self) -> OneWireResult<(), E> {
        self.pin.set_high().map_err(OneWireError::PinError)
    }

    /// Drives the line low
    pub fn drive_low(&mut self) -> OneWireResult<(), E> {
        self.pin.set_low().map_err(OneWireError::PinError)
    }

    pub fn is_high(&mut self) -> OneWireResult<bool, E> {
        self.pin.is_high().map_err(OneWireError::PinError)
    }

    pub fn listen_falling(&mut self) {
        self.pin.listen_falling();
    }

    pub fn unlisten(&mut self) {
        self.pin.unlisten();
    }
}
