//! Serial link abstraction
//!
//! The protocol layers are written against the [Interface] trait so they can
//! be driven by anything that behaves like a UART: a real serial port in
//! production, a scripted mock in tests.

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::SerialPort;

use crate::error::ConnectionError;

/// A full-duplex byte link to the target device.
pub trait Interface {
    /// Write all of `data` to the link, or fail.
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Read exactly `buf.len()` bytes within `timeout`.
    ///
    /// A partial read is a [ConnectionError::Timeout], never a short success.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), ConnectionError>;

    /// Reconfigure the baud rate of the underlying UART.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError>;

    /// The currently configured baud rate.
    fn baud_rate(&self) -> Result<u32, ConnectionError>;
}

/// [Interface] implementation backed by a [serialport] port.
pub struct SerialInterface {
    port: Box<dyn SerialPort>,
}

impl SerialInterface {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        SerialInterface { port }
    }

    /// Recover the underlying serial port.
    pub fn into_inner(self) -> Box<dyn SerialPort> {
        self.port
    }
}

impl Interface for SerialInterface {
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), ConnectionError> {
        self.port.set_timeout(timeout)?;
        self.port.read_exact(buf)?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ConnectionError> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }

    fn baud_rate(&self) -> Result<u32, ConnectionError> {
        Ok(self.port.baud_rate()?)
    }
}
