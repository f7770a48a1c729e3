//! The connection descriptor, the four-phase handshake, and the client facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::codec::{self, Message};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::events::{topics, EventBus, Payload};
use crate::pin::{AnalogIndex, Pin, PinMode, PinTable};
use crate::transport::Transport;

/// Discovered/negotiated facts about the current connection, plus the tuning
/// knob the framing reader uses to back off on transient short reads.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDescriptor {
    pub protocol_version: String,
    pub firmware_name: String,
    pub connected: bool,
    pub poll_interval: Duration,
}

impl ConnectionDescriptor {
    fn new(poll_interval: Duration) -> Self {
        ConnectionDescriptor {
            protocol_version: String::new(),
            firmware_name: String::new(),
            connected: false,
            poll_interval,
        }
    }
}

/// Everything guarded by the single mutex: the transport, the pin table, the
/// analog index and the connection descriptor.
struct State<T> {
    transport: T,
    pins: PinTable,
    analog_index: AnalogIndex,
    descriptor: ConnectionDescriptor,
}

impl<T: Transport> State<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(bytes = ?bytes, "writing outbound bytes");
        let mut offset = 0;
        while offset < bytes.len() {
            let written = self.transport.write(&bytes[offset..])?;
            if written == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "transport accepted zero bytes",
                )
                .into());
            }
            offset += written;
        }
        Ok(())
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    events: EventBus,
    background: Mutex<Option<JoinHandle<()>>>,
    /// Set by `disconnect` before it waits for the state lock, so a background
    /// step stuck retrying transient empty reads gives up within one
    /// `poll_interval` instead of holding the lock forever.
    closing: AtomicBool,
}

/// The public client: aggregates the transport, the pin table, the analog
/// index, the connection descriptor, and the event bus, and exposes the
/// operations of the external interface.
pub struct Client<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Client {
            shared: self.shared.clone(),
        }
    }
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(DEFAULT_POLL_INTERVAL_MS);

impl<T: Transport + Send + 'static> Client<T> {
    pub fn new(transport: T) -> Self {
        Self::with_poll_interval(transport, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(transport: T, poll_interval: Duration) -> Self {
        Client {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    transport,
                    pins: Vec::new(),
                    analog_index: Vec::new(),
                    descriptor: ConnectionDescriptor::new(poll_interval),
                }),
                events: EventBus::new(),
                background: Mutex::new(None),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn connected(&self) -> bool {
        self.shared.state.lock().descriptor.connected
    }

    pub fn protocol_version(&self) -> String {
        self.shared.state.lock().descriptor.protocol_version.clone()
    }

    pub fn firmware_name(&self) -> String {
        self.shared.state.lock().descriptor.firmware_name.clone()
    }

    pub fn pins(&self) -> PinTable {
        self.shared.state.lock().pins.clone()
    }

    pub fn analog_index(&self) -> AnalogIndex {
        self.shared.state.lock().analog_index.clone()
    }

    /// Registers a one-shot handler on `topic`. Exposes the event bus contract
    /// directly so external subscribers can observe `Error`, `I2cReply`,
    /// `StringData`, and the dynamic `DigitalRead<N>`/`AnalogRead<N>`/`Pin<N>State`
    /// families this core publishes.
    pub fn subscribe_once<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: FnMut(Payload) + Send + 'static,
    {
        self.shared.events.subscribe_once(topic, handler);
    }

    /// Drives the four-phase handshake to completion, then spawns the
    /// background processing task. Requires an ambient `tokio` runtime, since
    /// the background task is spawned with [`tokio::task::spawn_blocking`].
    #[instrument(skip(self))]
    pub fn connect(&self) -> Result<()> {
        self.handshake_phase(
            codec::encode_protocol_version_query(),
            topics::PROTOCOL_VERSION,
        )
        .map_err(Error::into_handshake)?;
        self.handshake_phase(codec::encode_firmware_query(), topics::FIRMWARE_QUERY)
            .map_err(Error::into_handshake)?;
        self.handshake_phase(codec::encode_capability_query(), topics::CAPABILITY_QUERY)
            .map_err(Error::into_handshake)?;
        self.handshake_phase(
            codec::encode_analog_mapping_query(),
            topics::ANALOG_MAPPING_QUERY,
        )
        .map_err(Error::into_handshake)?;

        self.toggle_pin_reporting(0, true, REPORT_DIGITAL)
            .map_err(Error::into_handshake)?;
        self.toggle_pin_reporting(1, true, REPORT_DIGITAL)
            .map_err(Error::into_handshake)?;

        {
            let mut state = self.shared.state.lock();
            state.descriptor.connected = true;
        }
        info!("handshake complete");
        self.spawn_background_task();
        Ok(())
    }

    /// Sends `query` and processes inbound messages until `topic` fires once.
    fn handshake_phase(&self, query: Vec<u8>, topic: &str) -> Result<()> {
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        self.shared.events.subscribe_once(topic, move |_payload| {
            done_clone.store(true, Ordering::SeqCst);
        });
        {
            let mut state = self.shared.state.lock();
            state.write(&query)?;
        }
        while !done.load(Ordering::SeqCst) {
            self.process()?;
        }
        Ok(())
    }

    fn spawn_background_task(&self) {
        let shared = self.shared.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let client = Client { shared };
            loop {
                match client.process() {
                    Ok(()) => {}
                    Err(err) => {
                        warn!(error = %err, "background processing step failed, stopping");
                        client
                            .shared
                            .events
                            .publish(topics::ERROR, Payload::Text(err.to_string()));
                        break;
                    }
                }
            }
        });
        *self.shared.background.lock() = Some(handle);
    }

    /// Sets `connected = false` and closes the transport. The background
    /// processing task observes the close as a read failure and exits after
    /// its current iteration.
    ///
    /// Sets the cancellation flag before waiting on the state lock: a
    /// background step blocked retrying transient empty reads (holding the
    /// lock for the whole step, per §5) notices it within one `poll_interval`
    /// and returns instead of retrying forever, so this call does not deadlock.
    #[instrument(skip(self))]
    pub fn disconnect(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        state.descriptor.connected = false;
        let result = state.transport.close();
        self.shared.closing.store(false, Ordering::SeqCst);
        result?;
        info!("disconnected");
        Ok(())
    }

    /// One processing step: decodes exactly one inbound message and mutates
    /// the pin table and/or publishes events. Reusable directly in tests.
    ///
    /// A malformed message is discarded and nothing is published; it does not
    /// abort the handshake or the background loop, only a transport failure does.
    #[instrument(skip(self))]
    pub fn process(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let poll_interval = state.descriptor.poll_interval;
        match codec::read_message(&mut state.transport, poll_interval, &self.shared.closing) {
            Ok(message) => self.dispatch(&mut state, message),
            Err(Error::Malformed { reason }) => {
                warn!(reason, "discarding malformed message");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn dispatch(&self, state: &mut State<T>, message: Message) -> Result<()> {
        match message {
            Message::ProtocolVersion { major, minor } => {
                let version = format!("{major}.{minor}");
                state.descriptor.protocol_version = version.clone();
                self.shared
                    .events
                    .publish(topics::PROTOCOL_VERSION, Payload::Text(version));
            }
            Message::Analog { channel, value } => {
                if let Some(&pin) = state.analog_index.get(channel as usize) {
                    if let Some(slot) = state.pins.get_mut(pin as usize) {
                        slot.value = value as u32;
                        let payload = (value as u32).to_be_bytes().to_vec();
                        self.shared
                            .events
                            .publish(&topics::analog_read(channel), Payload::Bytes(payload));
                    }
                }
            }
            Message::Digital { port, value } => {
                for i in 0..8u8 {
                    let pin = 8 * port + i;
                    if let Some(slot) = state.pins.get_mut(pin as usize) {
                        if slot.mode == PinMode::Input {
                            let bit = ((value >> i) & 0x01) as u32;
                            slot.value = bit;
                            self.shared.events.publish(
                                &topics::digital_read(pin),
                                Payload::Bytes(vec![bit as u8]),
                            );
                        }
                    }
                }
            }
            Message::ReportFirmware { name, .. } => {
                state.descriptor.firmware_name = name.clone();
                self.shared
                    .events
                    .publish(topics::FIRMWARE_QUERY, Payload::Text(name));
            }
            Message::CapabilityResponse { pins } => {
                let mut table = Vec::with_capacity(pins.len());
                for mode_pairs in pins {
                    let mut pin = Pin::default();
                    for (mode_id, _resolution) in mode_pairs {
                        if let Some(mode) = PinMode::from_wire_id(mode_id) {
                            pin.supported_modes.insert(mode);
                        }
                    }
                    table.push(pin);
                }
                let count = table.len();
                state.pins = table;
                for i in 0..count as u8 {
                    self.shared.events.add_topic(topics::digital_read(i));
                    self.shared.events.add_topic(topics::pin_state(i));
                }
                self.shared
                    .events
                    .publish(topics::CAPABILITY_QUERY, Payload::Empty);
            }
            Message::AnalogMappingResponse { mapping } => {
                let mut analog_index = Vec::new();
                for (pin, &channel) in mapping.iter().enumerate() {
                    if let Some(slot) = state.pins.get_mut(pin) {
                        slot.analog_channel = channel;
                    }
                    if channel != NOT_ANALOG {
                        analog_index.push(pin as u8);
                        self.shared.events.add_topic(topics::analog_read(channel));
                    }
                }
                state.analog_index = analog_index;
                self.shared
                    .events
                    .publish(topics::ANALOG_MAPPING_QUERY, Payload::Empty);
            }
            Message::PinStateResponse { pin, mode, value } => {
                // Mutates the pin as actually stored in the table, never a copy.
                if let Some(slot) = state.pins.get_mut(pin as usize) {
                    if let Some(mode) = PinMode::from_wire_id(mode) {
                        slot.mode = mode;
                    }
                    slot.value = value;
                }
                self.shared.events.publish(
                    &topics::pin_state(pin),
                    Payload::PinState { pin, mode, value },
                );
            }
            Message::I2CReply {
                slave_address,
                register,
                data,
            } => {
                self.shared.events.publish(
                    topics::I2C_REPLY,
                    Payload::I2CReply {
                        slave_address,
                        register,
                        data,
                    },
                );
            }
            Message::StringData(text) => {
                self.shared.events.publish(topics::STRING_DATA, Payload::Text(text));
            }
            Message::Empty => {}
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn set_pin_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(slot) = state.pins.get_mut(pin as usize) {
            slot.mode = mode;
        }
        let bytes = codec::encode_set_pin_mode(pin, mode.wire_id());
        debug!(pin, ?mode, "set_pin_mode");
        state.write(&bytes)
    }

    pub fn digital_write(&self, pin: u8, value: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        let port = pin / 8;
        if let Some(slot) = state.pins.get_mut(pin as usize) {
            slot.value = value as u32;
        }
        let mut mask: u16 = 0;
        for i in 0..8u8 {
            let sibling = 8 * port + i;
            if let Some(slot) = state.pins.get(sibling as usize) {
                if slot.value != 0 {
                    mask |= 1 << i;
                }
            }
        }
        let bytes = codec::encode_digital_port_message(port, mask);
        state.write(&bytes)
    }

    /// `pin` must be `< 16`: the value is truncated into the wire format's
    /// 4-bit channel field with no range check, so pins `>= 16` silently alias.
    pub fn analog_write(&self, pin: u8, value: u16) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(slot) = state.pins.get_mut(pin as usize) {
            slot.value = value as u32;
        }
        let bytes = codec::encode_analog_message(pin, value);
        state.write(&bytes)
    }

    pub fn toggle_pin_reporting(&self, pin_or_port: u8, enable: bool, mode: u8) -> Result<()> {
        let mut state = self.shared.state.lock();
        let bytes = codec::encode_toggle_pin_reporting(pin_or_port, enable, mode);
        state.write(&bytes)
    }

    pub fn reset(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_reset())
    }

    pub fn query_protocol_version(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_protocol_version_query())
    }

    pub fn query_firmware(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_firmware_query())
    }

    pub fn query_capabilities(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_capability_query())
    }

    pub fn query_analog_mapping(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_analog_mapping_query())
    }

    pub fn query_pin_state(&self, pin: u8) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_pin_state_query(pin))
    }

    pub fn i2c_read_request(&self, address: u8, n: u16) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_i2c_read_request(address, n))
    }

    pub fn i2c_write_request(&self, address: u8, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_i2c_write_request(address, data))
    }

    pub fn i2c_config(&self, data: &[u16]) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.write(&codec::encode_i2c_config(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;

    fn client_with(bytes: Vec<u8>) -> Client<ScriptedTransport> {
        Client::with_poll_interval(ScriptedTransport::new(bytes), Duration::from_millis(1))
    }

    #[test]
    fn not_connected_until_handshake_completes() {
        let client = client_with(vec![]);
        assert!(!client.connected());
    }

    #[test]
    fn protocol_version_message_updates_descriptor_and_publishes() {
        let client = client_with(vec![REPORT_VERSION, 0x02, 0x05]);
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        client.subscribe_once(topics::PROTOCOL_VERSION, move |payload| {
            if let Payload::Text(text) = payload {
                assert_eq!(text, "2.5");
            }
            seen_clone.store(true, Ordering::SeqCst);
        });
        client.process().unwrap();
        assert_eq!(client.protocol_version(), "2.5");
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn capability_response_rebuilds_pin_table() {
        let client = client_with(vec![
            START_SYSEX,
            CAPABILITY_RESPONSE,
            0x00,
            0x01,
            0x01,
            0x01,
            NOT_ANALOG,
            NOT_ANALOG,
            END_SYSEX,
        ]);
        client.process().unwrap();
        let pins = client.pins();
        assert_eq!(pins.len(), 2);
        assert!(pins[0].supported_modes.contains(&PinMode::Input));
        assert!(pins[0].supported_modes.contains(&PinMode::Output));
        assert!(pins[1].supported_modes.is_empty());
    }

    #[test]
    fn analog_mapping_response_populates_analog_index_in_order() {
        let client = client_with(vec![
            START_SYSEX,
            CAPABILITY_RESPONSE,
            NOT_ANALOG,
            NOT_ANALOG,
            END_SYSEX,
        ]);
        client.process().unwrap();
        {
            let mut state = client.shared.state.lock();
            state.transport.feed([
                START_SYSEX,
                ANALOG_MAPPING_RESPONSE,
                NOT_ANALOG,
                0x00,
                END_SYSEX,
            ]);
        }
        client.process().unwrap();
        assert_eq!(client.analog_index(), vec![1]);
    }

    #[test]
    fn digital_message_dispatch_only_updates_input_pins() {
        let client = client_with(vec![]);
        {
            let mut state = client.shared.state.lock();
            state.pins = (0..16)
                .map(|i| {
                    let mut pin = Pin::default();
                    pin.mode = if i % 2 == 0 {
                        PinMode::Input
                    } else {
                        PinMode::Output
                    };
                    pin
                })
                .collect();
            state.transport.feed([DIGITAL_MESSAGE | 1, 0x7F, 0x7F]);
        }
        client.process().unwrap();
        let pins = client.pins();
        for i in 8..16 {
            if i % 2 == 0 {
                assert_eq!(pins[i].value, 1);
            } else {
                assert_eq!(pins[i].value, 0);
            }
        }
    }

    #[test]
    fn analog_message_dispatch_uses_analog_index() {
        let client = client_with(vec![]);
        {
            let mut state = client.shared.state.lock();
            state.pins = vec![Pin::default(); 4];
            state.analog_index = vec![3];
            state.transport.feed([ANALOG_MESSAGE, 0x7F, 0x01]);
        }
        client.process().unwrap();
        assert_eq!(client.pins()[3].value, 255);
    }

    #[test]
    fn digital_write_recomputes_port_mask() {
        let client = client_with(vec![]);
        {
            let mut state = client.shared.state.lock();
            state.pins = vec![Pin::default(); 16];
        }
        client.digital_write(0, true).unwrap();
        client.digital_write(2, true).unwrap();
        let written = client.shared.state.lock().transport.written.clone();
        assert_eq!(
            written,
            vec![DIGITAL_MESSAGE, 0x01, 0x00, DIGITAL_MESSAGE, 0x05, 0x00]
        );
    }

    #[test]
    fn analog_write_emits_14_bit_split_value() {
        let client = client_with(vec![]);
        {
            let mut state = client.shared.state.lock();
            state.pins = vec![Pin::default(); 16];
        }
        client.analog_write(3, 0x3FFF).unwrap();
        let written = client.shared.state.lock().transport.written.clone();
        assert_eq!(written, vec![ANALOG_MESSAGE | 3, 0x7F, 0x7F]);
    }

    #[test]
    fn set_pin_mode_is_idempotent_across_repeated_calls() {
        let client = client_with(vec![]);
        {
            let mut state = client.shared.state.lock();
            state.pins = vec![Pin::default(); 4];
        }
        client.set_pin_mode(2, PinMode::Input).unwrap();
        client.set_pin_mode(2, PinMode::Input).unwrap();
        let written = client.shared.state.lock().transport.written.clone();
        assert_eq!(
            written,
            vec![SET_PIN_MODE, 2, 0, SET_PIN_MODE, 2, 0]
        );
        assert_eq!(client.pins()[2].mode, PinMode::Input);
    }

    #[test]
    fn malformed_message_is_discarded_without_erroring() {
        // A sysex pin-state response truncated before its mode byte: decodable
        // framing, invalid payload. Processing must continue, not abort.
        let client = client_with(vec![START_SYSEX, PIN_STATE_RESPONSE, END_SYSEX]);
        client.process().unwrap();
        assert_eq!(client.pins().len(), 0);
    }

    #[test]
    fn disconnect_marks_not_connected_and_closes_transport() {
        let client = client_with(vec![]);
        {
            let mut state = client.shared.state.lock();
            state.descriptor.connected = true;
        }
        client.disconnect().unwrap();
        assert!(!client.connected());
        let err = client.process().unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn connect_drives_the_four_phase_handshake() {
        let mut script = vec![REPORT_VERSION, 0x02, 0x05];
        script.extend([
            START_SYSEX,
            REPORT_FIRMWARE,
            0x02,
            0x05,
            b'F',
            0,
            b'o',
            0,
            END_SYSEX,
        ]);
        script.extend([
            START_SYSEX,
            CAPABILITY_RESPONSE,
            0x00,
            0x01,
            0x01,
            0x01,
            NOT_ANALOG,
            NOT_ANALOG,
            END_SYSEX,
        ]);
        script.extend([
            START_SYSEX,
            ANALOG_MAPPING_RESPONSE,
            NOT_ANALOG,
            0x00,
            END_SYSEX,
        ]);
        let client = client_with(script);

        client.connect().unwrap();

        assert_eq!(client.protocol_version(), "2.5");
        assert_eq!(client.firmware_name(), "Fo");
        let pins = client.pins();
        assert_eq!(pins.len(), 2);
        assert!(pins[0].supported_modes.contains(&PinMode::Input));
        assert!(pins[0].supported_modes.contains(&PinMode::Output));
        assert_eq!(client.analog_index(), vec![1]);
        assert!(client.connected());

        let written = client.shared.state.lock().transport.written.clone();
        assert_eq!(
            written,
            vec![
                REPORT_VERSION,
                START_SYSEX,
                REPORT_FIRMWARE,
                END_SYSEX,
                START_SYSEX,
                CAPABILITY_QUERY,
                END_SYSEX,
                START_SYSEX,
                ANALOG_MAPPING_QUERY,
                END_SYSEX,
                REPORT_DIGITAL,
                0x01,
                REPORT_DIGITAL | 1,
                0x01,
            ]
        );

        client.disconnect().unwrap();
    }

    #[test]
    fn i2c_reply_publishes_decoded_fields() {
        let client = client_with(vec![
            START_SYSEX,
            I2C_REPLY,
            0x50,
            0x00,
            0x10,
            0x00,
            0x41,
            0x00,
            0x42,
            0x00,
            END_SYSEX,
        ]);
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        client.subscribe_once(topics::I2C_REPLY, move |payload| {
            if let Payload::I2CReply {
                slave_address,
                register,
                data,
            } = payload
            {
                assert_eq!(slave_address, 0x50);
                assert_eq!(register, 0x10);
                assert_eq!(data, vec![0x41, 0x42]);
            } else {
                panic!("wrong payload shape");
            }
            seen_clone.store(true, Ordering::SeqCst);
        });
        client.process().unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }
}
