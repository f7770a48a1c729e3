//! A minimal named-topic publish/subscribe bus.
//!
//! Sized for this core's own needs rather than as a reusable general-purpose
//! primitive: delivery is synchronous and happens on the publisher's call stack,
//! and the only subscription kind is fire-once.

use std::collections::HashMap;

use parking_lot::Mutex;

/// The payload shapes this core publishes. Kept as a flat enum rather than a
/// boxed `dyn Any` — the set of shapes decoded messages produce is closed.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    PinState { pin: u8, mode: u8, value: u32 },
    I2CReply {
        slave_address: u16,
        register: u16,
        data: Vec<u8>,
    },
    Empty,
}

type Handler = Box<dyn FnMut(Payload) + Send>;

/// Topic names this core publishes to and subscribes on.
pub mod topics {
    pub const PROTOCOL_VERSION: &str = "ProtocolVersion";
    pub const FIRMWARE_QUERY: &str = "FirmwareQuery";
    pub const CAPABILITY_QUERY: &str = "CapabilityQuery";
    pub const ANALOG_MAPPING_QUERY: &str = "AnalogMappingQuery";
    pub const I2C_REPLY: &str = "I2cReply";
    pub const STRING_DATA: &str = "StringData";
    pub const ERROR: &str = "Error";

    pub fn digital_read(pin: u8) -> String {
        format!("DigitalRead{pin}")
    }

    pub fn analog_read(channel: u8) -> String {
        format!("AnalogRead{channel}")
    }

    pub fn pin_state(pin: u8) -> String {
        format!("Pin{pin}State")
    }
}

#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a topic on demand if it does not already exist. `publish` and
    /// `subscribe_once` also create topics on demand, so this is only needed to
    /// make a topic observable before anything has published or subscribed to it.
    pub fn add_topic(&self, name: impl Into<String>) {
        self.topics.lock().entry(name.into()).or_default();
    }

    /// Registers `handler` to fire exactly once on the next `publish` to `topic`.
    pub fn subscribe_once<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: FnMut(Payload) + Send + 'static,
    {
        self.topics
            .lock()
            .entry(topic.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Delivers `payload` to every subscriber currently registered on `topic`,
    /// then clears them — each fires at most once, matching `subscribe_once`.
    pub fn publish(&self, topic: &str, payload: Payload) {
        let handlers = {
            let mut topics = self.topics.lock();
            let slot = topics.entry(topic.to_string()).or_default();
            std::mem::take(slot)
        };
        for mut handler in handlers {
            handler(payload.clone());
        }
    }
}
