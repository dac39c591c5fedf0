//! Request/response transport to a target device
//!
//! [Connection] owns the serial interface and speaks the framed command
//! protocol: it encodes requests as single SLIP frames, demultiplexes
//! replies by direction and opcode, and decodes the status trailer the
//! loader appends to most responses.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::{
    command::{Command, CommandType, DEFAULT_TIMEOUT, DIRECTION_RESPONSE, HEADER_SIZE},
    error::{ConnectionError, Error, RomError, RomErrorKind, TimedOutCommand},
    interface::Interface,
};

pub mod slip;

const MAX_SYNC_ATTEMPTS: usize = 5;
const MAX_RESPONSE_ATTEMPTS: usize = 100;

/// Banner printed by the ROM loader once it is ready for commands.
const DOWNLOAD_BANNER: &[u8] = b"waiting for download\r\n";

/// A decoded response to a command
///
/// `return_length` and `value` are the length and value fields of the
/// response header; `body` is everything after the header, with the status
/// trailer already stripped for commands that carry one.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub return_length: u16,
    pub value: u32,
    pub body: Vec<u8>,
}

/// A connection with a target device
#[derive(Debug)]
pub struct Connection<I: Interface> {
    interface: I,
    status_len: usize,
}

impl<I: Interface> Connection<I> {
    pub fn new(interface: I) -> Self {
        Connection {
            interface,
            // All supported chips answer with the wide trailer until a stub
            // profile says otherwise.
            status_len: 4,
        }
    }

    /// Width of the status trailer expected on responses.
    pub fn status_len(&self) -> usize {
        self.status_len
    }

    /// Reconfigure the expected status trailer width (2 or 4 bytes).
    pub fn set_status_len(&mut self, status_len: usize) {
        self.status_len = status_len;
    }

    /// Block until the ROM loader announces download mode.
    ///
    /// Matches the banner byte-by-byte, restarting on mismatch, so it locks
    /// on regardless of what other console output precedes it.
    pub fn wait_for_download_mode(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + DEFAULT_TIMEOUT * 5;
        let mut matched = 0;

        while Instant::now() < deadline {
            let mut byte = [0u8; 1];
            match self.interface.read_exact(&mut byte, DEFAULT_TIMEOUT) {
                Ok(()) => {}
                Err(ConnectionError::Timeout(_)) => continue,
                Err(err) => return Err(err.into()),
            }

            if byte[0] != DOWNLOAD_BANNER[matched] {
                matched = 0;
            }
            if byte[0] == DOWNLOAD_BANNER[matched] {
                matched += 1;
                if matched == DOWNLOAD_BANNER.len() {
                    info!("Download boot detected");
                    return Ok(());
                }
            }
        }

        debug!("Download boot timeout");
        Err(Error::Connection(ConnectionError::Timeout(
            TimedOutCommand::default(),
        )))
    }

    /// Try to sync with the device.
    ///
    /// Any SYNC reply with a nonzero header length is accepted; the loader
    /// answers the first successful SYNC with a burst of them.
    pub fn sync(&mut self) -> Result<(), Error> {
        for attempt in 0..MAX_SYNC_ATTEMPTS {
            debug!("Sync attempt {attempt}");
            match self.command(Command::Sync) {
                Ok(response) if response.return_length != 0 => {
                    debug!(
                        "Sync received, len={:#x} val={:#x}",
                        response.return_length, response.value
                    );
                    return Ok(());
                }
                Ok(_) => continue,
                Err(Error::Connection(ConnectionError::Timeout(_))) => continue,
                Err(err) => return Err(err),
            }
        }

        debug!("Sync timeout");
        Err(Error::Connection(ConnectionError::Timeout(
            CommandType::Sync.into(),
        )))
    }

    /// Write a command to the device as a single SLIP frame.
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {command:02x?}");

        let frame = slip::encode_frame(&command.encode());
        self.interface.write(&frame)?;

        Ok(())
    }

    /// Write a command and await its response.
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.command_with_timeout(command, ty.timeout())
    }

    /// Write a command and await its response, with an explicit per-frame
    /// read timeout.
    ///
    /// Unrelated frames (loader chatter, stale replies) are filtered out by
    /// direction and opcode; after 100 received frames without a match the
    /// command has timed out.
    pub fn command_with_timeout(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(command)?;

        for _ in 0..MAX_RESPONSE_ATTEMPTS {
            let frame = slip::read_frame(&mut self.interface, timeout)?;
            if frame.len() < HEADER_SIZE
                || frame[0] != DIRECTION_RESPONSE
                || frame[1] != ty as u8
            {
                debug!("Discarding unrelated frame ({} bytes)", frame.len());
                continue;
            }

            let return_length = u16::from_le_bytes([frame[2], frame[3]]);
            let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            let mut body = frame[HEADER_SIZE..].to_vec();

            if ty.expects_status() {
                if body.len() < self.status_len {
                    return Err(Error::InvalidResponse(format!(
                        "expected a {} byte status trailer, got {} body bytes",
                        self.status_len,
                        body.len()
                    )));
                }
                let status = body[body.len() - self.status_len];
                let error = body[body.len() - self.status_len + 1];
                if status != 0 {
                    debug!("Command {ty} failed with code {error:#04x}");
                    return Err(Error::RomError(RomError::new(ty, RomErrorKind::from(error))));
                }
                let trailer_start = body.len() - self.status_len;
                body.truncate(trailer_start);
            }

            return Ok(CommandResponse {
                return_length,
                value,
                body,
            });
        }

        Err(Error::Connection(ConnectionError::Timeout(ty.into())))
    }

    /// Read one raw SLIP frame from the device.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        Ok(slip::read_frame(&mut self.interface, timeout)?)
    }

    /// Write a bare little-endian word as one SLIP frame.
    ///
    /// Used for the flow-control acknowledgements of READ_FLASH.
    pub fn write_raw(&mut self, value: u32) -> Result<(), Error> {
        let frame = slip::encode_frame(&value.to_le_bytes());
        self.interface.write(&frame)?;
        Ok(())
    }

    /// Read a register on the device.
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        let response = self.command(Command::ReadReg { address })?;
        Ok(response.value)
    }

    /// Write a register on the device.
    pub fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.command(Command::WriteReg {
            address,
            value,
            mask,
        })?;
        Ok(())
    }

    /// Reconfigure the baud rate of the local interface.
    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.interface.set_baud_rate(baud)?;
        Ok(())
    }

    /// The baud rate of the local interface.
    pub fn baud(&self) -> Result<u32, Error> {
        Ok(self.interface.baud_rate()?)
    }
}

#[cfg(test)]
impl Connection<crate::interface::mock::MockInterface> {
    pub(crate) fn mock(&mut self) -> &mut crate::interface::mock::MockInterface {
        &mut self.interface
    }
}
