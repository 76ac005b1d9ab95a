//! Interrupt-driven receiver for single-wire sensors that answer a wake pulse
//! with a pulse-width coded bit stream (DHT11, DHT22, AM2302 and relatives).
//!
//! One pin does everything: it is driven low for the wake pulse, then released
//! to the pull-up and watched for falling edges. Each bit is a fixed low pulse
//! followed by a high pulse whose length tells a `0` from a `1`, so the time
//! between two falling edges is all that has to be recorded. That happens in the
//! edge interrupt, in constant time. Turning intervals into bytes happens later
//! in task context, see [`Session`].
//!
//! The decoded bytes are not validated here; checksums and unit conversion are
//! left to the sensor-specific code consuming a [`Reading`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod classify;
mod error;
pub mod hal;
mod line;
mod scratch;
mod session;
mod shared;
pub mod timing;

pub use error::{OneWireError, OneWireResult};
pub use hal::{Clock, Defer, EmbassyClock, FallingEdge, OneShotTimer};
pub use line::Line;
pub use scratch::Scratch;
pub use session::{Outcome, Reading, Session, State};
pub use shared::SharedSession;
pub use timing::Timing;
