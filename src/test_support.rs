//! In-memory scripted transport shared by this crate's own test modules.
//!
//! Dependency-free stand-in for the kind of fixed-buffer mock transport this
//! core's lineage exercises its protocol layer with.

use std::collections::VecDeque;

use crate::transport::Transport;

/// A transport whose inbound bytes are scripted ahead of time and whose
/// outbound bytes are recorded for assertions. `read` returns one byte at a
/// time by default so tests can script exact short-read/EOF sequences.
pub struct ScriptedTransport {
    inbound: VecDeque<u8>,
    pub written: Vec<u8>,
    closed: bool,
}

impl ScriptedTransport {
    pub fn new(inbound: impl IntoIterator<Item = u8>) -> Self {
        ScriptedTransport {
            inbound: inbound.into_iter().collect(),
            written: Vec::new(),
            closed: false,
        }
    }

    pub fn empty() -> Self {
        Self::new([])
    }

    pub fn feed(&mut self, bytes: impl IntoIterator<Item = u8>) {
        self.inbound.extend(bytes);
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match self.inbound.pop_front() {
            Some(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.closed = true;
        Ok(())
    }
}
