//! Wire-protocol byte constants, bit-exact with the established Firmata dialect.

pub const DIGITAL_MESSAGE: u8 = 0x90;
pub const DIGITAL_MESSAGE_BOUND: u8 = 0x9F;
pub const ANALOG_MESSAGE: u8 = 0xE0;
pub const ANALOG_MESSAGE_BOUND: u8 = 0xEF;
pub const REPORT_ANALOG: u8 = 0xC0;
pub const REPORT_DIGITAL: u8 = 0xD0;
pub const SET_PIN_MODE: u8 = 0xF4;
pub const REPORT_VERSION: u8 = 0xF9;
pub const SYSTEM_RESET: u8 = 0xFF;
pub const START_SYSEX: u8 = 0xF0;
pub const END_SYSEX: u8 = 0xF7;

pub const CAPABILITY_QUERY: u8 = 0x6B;
pub const CAPABILITY_RESPONSE: u8 = 0x6C;
pub const PIN_STATE_QUERY: u8 = 0x6D;
pub const PIN_STATE_RESPONSE: u8 = 0x6E;
pub const ANALOG_MAPPING_QUERY: u8 = 0x69;
pub const ANALOG_MAPPING_RESPONSE: u8 = 0x6A;
pub const STRING_DATA: u8 = 0x71;
pub const I2C_REQUEST: u8 = 0x76;
pub const I2C_REPLY: u8 = 0x77;
pub const I2C_CONFIG: u8 = 0x78;
pub const REPORT_FIRMWARE: u8 = 0x79;

pub const I2C_MODE_WRITE: u8 = 0x00;
pub const I2C_MODE_READ: u8 = 0x01;

/// Sentinel analog-channel value meaning "not an analog pin", both on the wire
/// (`AnalogMappingResponse`) and in the pin table.
pub const NOT_ANALOG: u8 = 0x7F;

/// Default interval the framing reader sleeps between transient short reads.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;
