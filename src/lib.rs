//! A host-side client for Firmata-style microcontroller wire protocols.
//!
//! This crate owns the message codec, the pin table, the four-phase connection
//! handshake, and the event bus consumers can subscribe to — not physical
//! transport construction (opening a serial port, picking a baud rate), which
//! stays the caller's concern via the [`Transport`] trait.

mod client;
mod codec;
mod constants;
mod error;
mod events;
mod pin;
mod transport;

#[cfg(test)]
mod test_support;

pub use client::{Client, ConnectionDescriptor};
pub use codec::Message;
pub use error::{Error, Result};
pub use events::{topics, EventBus, Payload};
pub use pin::{AnalogIndex, Pin, PinMode, PinTable};
pub use transport::{IoTransport, Transport};
