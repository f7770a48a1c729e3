//! The pin table: the in-process mirror of device pin state.

use std::collections::HashSet;

use crate::constants::NOT_ANALOG;

/// A mode tag a pin can be configured in.
///
/// Carries the firmware-protocol mode id it corresponds to so pin-table code can
/// translate directly to and from `CapabilityResponse`/`PinStateResponse` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinMode {
    Input,
    Output,
    Analog,
    Pwm,
    Servo,
}

impl PinMode {
    /// The protocol mode id used in `CapabilityResponse`/`set_pin_mode`/`PinStateResponse`.
    pub fn wire_id(self) -> u8 {
        match self {
            PinMode::Input => 0,
            PinMode::Output => 1,
            PinMode::Analog => 2,
            PinMode::Pwm => 3,
            PinMode::Servo => 4,
        }
    }

    /// Translate a protocol mode id; unrecognized ids (e.g. i2c, onewire, stepper)
    /// are outside the `{Input, Output, Analog, Pwm, Servo}` tag set this core tracks.
    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(PinMode::Input),
            1 => Some(PinMode::Output),
            2 => Some(PinMode::Analog),
            3 => Some(PinMode::Pwm),
            4 => Some(PinMode::Servo),
            _ => None,
        }
    }
}

/// A single device pin as mirrored by the host.
#[derive(Debug, Clone)]
pub struct Pin {
    pub supported_modes: HashSet<PinMode>,
    pub mode: PinMode,
    pub value: u32,
    /// Device-assigned analog channel, or [`NOT_ANALOG`] if this pin carries none.
    pub analog_channel: u8,
}

impl Default for Pin {
    fn default() -> Self {
        Pin {
            supported_modes: HashSet::new(),
            mode: PinMode::Output,
            value: 0,
            analog_channel: NOT_ANALOG,
        }
    }
}

impl Pin {
    pub fn is_analog(&self) -> bool {
        self.analog_channel != NOT_ANALOG && self.supported_modes.contains(&PinMode::Analog)
    }
}

/// The pin table: an ordered sequence indexed by device pin number. Empty until
/// a `CapabilityResponse` is decoded; fixed-length thereafter for the connection.
pub type PinTable = Vec<Pin>;

/// Maps device analog channel number to the pin number that carries it.
pub type AnalogIndex = Vec<u8>;
