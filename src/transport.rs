//! The byte-stream abstraction the core depends on.

use std::io::{Read, Write};

/// A thin abstraction over a full-duplex blocking byte stream.
///
/// Reads may return fewer bytes than requested (including zero); the framing
/// reader treats that, and an end-of-stream read, as transient and retries after
/// a short delay rather than as a terminal error.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    fn close(&mut self) -> std::io::Result<()>;
}

/// Adapts any blocking [`Read`] + [`Write`] byte stream (a serial port, a TCP
/// socket, a pipe) into a [`Transport`]. `close` is a best-effort flush; the
/// underlying stream is actually released when `T` is dropped.
pub struct IoTransport<T> {
    inner: T,
}

impl<T> IoTransport<T> {
    pub fn new(inner: T) -> Self {
        IoTransport { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Write + Send> Transport for IoTransport<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
