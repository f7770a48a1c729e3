//! Stateless message encoders and the blocking framing reader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use crate::constants::*;
use crate::error::Error;
use crate::transport::Transport;

/// One fully decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ProtocolVersion {
        major: u8,
        minor: u8,
    },
    Analog {
        channel: u8,
        value: u16,
    },
    Digital {
        port: u8,
        value: u16,
    },
    ReportFirmware {
        major: u8,
        minor: u8,
        name: String,
    },
    /// One `(mode, resolution)` list per pin, in device pin order.
    CapabilityResponse {
        pins: Vec<Vec<(u8, u8)>>,
    },
    /// One mapping byte per pin, in device pin order; [`NOT_ANALOG`] for non-analog pins.
    AnalogMappingResponse {
        mapping: Vec<u8>,
    },
    PinStateResponse {
        pin: u8,
        mode: u8,
        value: u32,
    },
    I2CReply {
        slave_address: u16,
        register: u16,
        data: Vec<u8>,
    },
    StringData(String),
    /// A recognized but uninteresting status (e.g. report-analog/report-digital
    /// acks) or an unrecognized SysEx command byte, silently ignored per §4.4.
    Empty,
}

fn join7(lo: u8, hi: u8) -> u16 {
    (lo as u16 & 0x7F) | ((hi as u16 & 0x7F) << 7)
}

fn split7(value: u16) -> (u8, u8) {
    ((value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8)
}

fn decode_chars(bytes: &[u8]) -> Result<String, Error> {
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        if pair.len() < 2 {
            return Err(Error::malformed("truncated character pair"));
        }
        let ch = join7(pair[0], pair[1]) as u8;
        if ch != 0 {
            out.push(ch);
        }
    }
    std::str::from_utf8(&out)
        .map(str::to_string)
        .map_err(|source| Error::Utf8 { source })
}

fn decode_capability_response(bytes: &[u8]) -> Result<Message, Error> {
    let mut pins = Vec::new();
    let mut current: Vec<(u8, u8)> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == NOT_ANALOG {
            pins.push(std::mem::take(&mut current));
            i += 1;
        } else {
            if i + 1 >= bytes.len() {
                return Err(Error::malformed("truncated capability response"));
            }
            current.push((bytes[i], bytes[i + 1]));
            i += 2;
        }
    }
    Ok(Message::CapabilityResponse { pins })
}

/// Decodes the payload following `0x0xF0 <cmd>` and preceding the trailing
/// `0xF7` (already stripped by the framing reader).
fn decode_sysex(payload: &[u8]) -> Result<Message, Error> {
    let Some((&cmd, rest)) = payload.split_first() else {
        return Ok(Message::Empty);
    };
    match cmd {
        CAPABILITY_RESPONSE => decode_capability_response(rest),
        // Walks every byte the framing reader captured for this envelope —
        // the envelope's own terminator already bounds the walk, so there is
        // no separate length derived from the pin table to under-read with.
        ANALOG_MAPPING_RESPONSE => Ok(Message::AnalogMappingResponse {
            mapping: rest.to_vec(),
        }),
        PIN_STATE_RESPONSE => {
            if rest.len() < 2 {
                return Err(Error::malformed("truncated pin state response"));
            }
            let pin = rest[0];
            let mode = rest[1];
            let mut value: u32 = 0;
            for (i, &byte) in rest[2..].iter().take(3).enumerate() {
                value |= (byte as u32 & 0x7F) << (7 * i);
            }
            Ok(Message::PinStateResponse { pin, mode, value })
        }
        REPORT_FIRMWARE => {
            if rest.len() < 2 {
                return Err(Error::malformed("truncated firmware report"));
            }
            let major = rest[0];
            let minor = rest[1];
            let name = decode_chars(&rest[2..])?;
            Ok(Message::ReportFirmware { major, minor, name })
        }
        I2C_REPLY => {
            if rest.len() < 4 {
                return Err(Error::malformed("truncated i2c reply"));
            }
            let slave_address = join7(rest[0], rest[1]);
            let register = join7(rest[2], rest[3]);
            let mut data = Vec::new();
            for pair in rest[4..].chunks(2) {
                if pair.len() < 2 {
                    return Err(Error::malformed("truncated i2c reply data"));
                }
                data.push(join7(pair[0], pair[1]) as u8);
            }
            Ok(Message::I2CReply {
                slave_address,
                register,
                data,
            })
        }
        STRING_DATA => Ok(Message::StringData(decode_chars(rest)?)),
        _ => Ok(Message::Empty),
    }
}

/// Decodes one fully-framed inbound message (the bytes the framing reader
/// assembled: a 3-byte channel/status message, or a complete `0xF0..0xF7` envelope).
pub fn decode_message(buf: &[u8]) -> Result<Message, Error> {
    let status = *buf.first().ok_or_else(|| Error::malformed("empty message"))?;
    match status {
        REPORT_VERSION => {
            if buf.len() < 3 {
                return Err(Error::malformed("truncated protocol version message"));
            }
            Ok(Message::ProtocolVersion {
                major: buf[1],
                minor: buf[2],
            })
        }
        DIGITAL_MESSAGE..=DIGITAL_MESSAGE_BOUND => {
            if buf.len() < 3 {
                return Err(Error::malformed("truncated digital message"));
            }
            Ok(Message::Digital {
                port: status & 0x0F,
                value: join7(buf[1], buf[2]),
            })
        }
        ANALOG_MESSAGE..=ANALOG_MESSAGE_BOUND => {
            if buf.len() < 3 {
                return Err(Error::malformed("truncated analog message"));
            }
            Ok(Message::Analog {
                channel: status & 0x0F,
                value: join7(buf[1], buf[2]),
            })
        }
        START_SYSEX => {
            let end = buf.len().checked_sub(1).filter(|&e| e > 0);
            match end {
                Some(end) if buf[end] == END_SYSEX => decode_sysex(&buf[1..end]),
                _ => Err(Error::malformed("unterminated sysex envelope")),
            }
        }
        _ => Ok(Message::Empty),
    }
}

fn closing_error() -> Error {
    Error::Transport {
        source: std::io::Error::new(std::io::ErrorKind::NotConnected, "transport is closing"),
    }
}

fn read_one(
    transport: &mut dyn Transport,
    poll_interval: Duration,
    cancel: &AtomicBool,
) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    loop {
        if cancel.load(Ordering::Acquire) {
            return Err(closing_error());
        }
        match transport.read(&mut byte) {
            Ok(0) => {
                trace!(?poll_interval, "transient short read, retrying");
                std::thread::sleep(poll_interval);
            }
            Ok(_) => return Ok(byte[0]),
            Err(source) => return Err(source.into()),
        }
    }
}

fn read_exact(
    transport: &mut dyn Transport,
    n: usize,
    poll_interval: Duration,
    cancel: &AtomicBool,
) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        if cancel.load(Ordering::Acquire) {
            return Err(closing_error());
        }
        match transport.read(&mut buf[filled..]) {
            Ok(0) => {
                trace!(?poll_interval, "transient short read, retrying");
                std::thread::sleep(poll_interval);
            }
            Ok(read) => filled += read,
            Err(source) => return Err(source.into()),
        }
    }
    Ok(buf)
}

/// Extracts exactly one inbound message from `transport`, retrying transient
/// short reads (including end-of-stream) after `poll_interval`.
///
/// `cancel` is polled once per retry so a `disconnect` racing a run of empty
/// reads can still make the background loop give up the state lock within one
/// `poll_interval`, instead of spinning on transient short reads forever while
/// holding it (see [`crate::Client::disconnect`]).
pub fn read_message(
    transport: &mut dyn Transport,
    poll_interval: Duration,
    cancel: &AtomicBool,
) -> Result<Message, Error> {
    let mut buf = read_exact(transport, 3, poll_interval, cancel)?;
    if buf[0] == START_SYSEX {
        loop {
            let byte = read_one(transport, poll_interval, cancel)?;
            buf.push(byte);
            if byte == END_SYSEX {
                break;
            }
        }
    }
    debug!(bytes = ?buf, "assembled one inbound message");
    decode_message(&buf)
}

pub fn encode_protocol_version_query() -> Vec<u8> {
    vec![REPORT_VERSION]
}

pub fn encode_firmware_query() -> Vec<u8> {
    vec![START_SYSEX, REPORT_FIRMWARE, END_SYSEX]
}

pub fn encode_capability_query() -> Vec<u8> {
    vec![START_SYSEX, CAPABILITY_QUERY, END_SYSEX]
}

pub fn encode_analog_mapping_query() -> Vec<u8> {
    vec![START_SYSEX, ANALOG_MAPPING_QUERY, END_SYSEX]
}

pub fn encode_pin_state_query(pin: u8) -> Vec<u8> {
    vec![START_SYSEX, PIN_STATE_QUERY, pin, END_SYSEX]
}

pub fn encode_set_pin_mode(pin: u8, mode_wire_id: u8) -> Vec<u8> {
    vec![SET_PIN_MODE, pin, mode_wire_id]
}

pub fn encode_digital_port_message(port: u8, mask: u16) -> Vec<u8> {
    let (lo, hi) = split7(mask);
    vec![DIGITAL_MESSAGE | (port & 0x0F), lo, hi]
}

/// `pin` is truncated into the 4-bit channel field with no range check — pins
/// ≥ 16 alias (see the precondition documented on [`crate::Client::analog_write`]).
pub fn encode_analog_message(pin: u8, value: u16) -> Vec<u8> {
    let (lo, hi) = split7(value);
    vec![ANALOG_MESSAGE | (pin & 0x0F), lo, hi]
}

pub fn encode_toggle_pin_reporting(pin_or_port: u8, state: bool, mode_base: u8) -> Vec<u8> {
    vec![mode_base | (pin_or_port & 0x0F), state as u8]
}

pub fn encode_reset() -> Vec<u8> {
    vec![SYSTEM_RESET]
}

pub fn encode_i2c_read_request(address: u8, n: u16) -> Vec<u8> {
    let (lo, hi) = split7(n);
    vec![
        START_SYSEX,
        I2C_REQUEST,
        address,
        I2C_MODE_READ << 3,
        lo,
        hi,
        END_SYSEX,
    ]
}

/// I²C outbound data is 7-bit split, distinct from `i2c_config`'s 8-bit split.
pub fn encode_i2c_write_request(address: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![START_SYSEX, I2C_REQUEST, address, I2C_MODE_WRITE << 3];
    for &byte in data {
        let (lo, hi) = split7(byte as u16);
        buf.push(lo);
        buf.push(hi);
    }
    buf.push(END_SYSEX);
    buf
}

/// `data` words are emitted as full 8-bit low/high byte pairs, not 7-bit split.
pub fn encode_i2c_config(data: &[u16]) -> Vec<u8> {
    let mut buf = vec![START_SYSEX, I2C_CONFIG];
    for &word in data {
        let bytes = word.to_le_bytes();
        buf.push(bytes[0]);
        buf.push(bytes[1]);
    }
    buf.push(END_SYSEX);
    buf
}
