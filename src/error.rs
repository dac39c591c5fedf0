//! Library errors

use std::{
    array::TryFromSliceError,
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use strum::VariantNames;
use thiserror::Error;

use crate::{command::CommandType, target::Chip};

/// All possible errors returned by esploader
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("{0}")]
    #[diagnostic(
        code(esploader::chip_detect_error),
        help("Supported chips are: {}\n\
              If your chip is supported, try hard-resetting the device and try again",
             Chip::VARIANTS.join(", "))
    )]
    ChipDetectError(String),

    #[error("No chip has been detected yet")]
    #[diagnostic(
        code(esploader::chip_not_detected),
        help("Synchronize with the loader and call `detect` before this operation")
    )]
    ChipNotDetected,

    #[error("Chip ID {0:#06x} is not supported")]
    #[diagnostic(code(esploader::unsupported_chip))]
    UnsupportedChip(u16),

    #[error("This command requires using the RAM stub")]
    #[diagnostic(
        code(esploader::stub_required),
        help("Upload and start the flasher stub with `run_stub` first")
    )]
    StubRequired,

    #[error("The loader has not been synchronized")]
    #[diagnostic(
        code(esploader::sync_required),
        help("Call `sync` before issuing commands")
    )]
    SyncRequired,

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(esploader::invalid_argument))]
    InvalidArgument(String),

    #[error("Invalid `offset` ({offset:#x}) and/or `size` ({size:#x}) argument(s)")]
    #[diagnostic(
        code(esploader::erase_region::invalid_argument),
        help("`offset` and `size` must be multiples of 0x1000 (4096)")
    )]
    InvalidEraseRegionArgument { offset: u32, size: u32 },

    #[error("Corrupt data, expected {0:#x} bytes but received {1:#x} bytes")]
    #[diagnostic(code(esploader::read_flash::corrupt_data))]
    CorruptData(usize, usize),

    #[error("Read more bytes than expected")]
    #[diagnostic(code(esploader::read_flash::read_more_than_expected))]
    ReadMoreThanExpected,

    #[error("Expected MD5 digest (16 bytes), received: {0:#x} bytes")]
    #[diagnostic(code(esploader::read_flash::incorrect_digest_length))]
    IncorrectDigestLength(usize),

    #[error("MD5 digest mismatch: expected {0:02x?}, received: {1:02x?}")]
    #[diagnostic(code(esploader::read_flash::digest_mismatch))]
    DigestMismatch(Vec<u8>, Vec<u8>),

    #[error("Invalid response: {0}")]
    #[diagnostic(code(esploader::invalid_response))]
    InvalidResponse(String),

    #[error("Invalid stub descriptor: {0}")]
    #[diagnostic(
        code(esploader::invalid_stub),
        help("Stub descriptors are the TOML files shipped with espflash, converted \
              from the JSON stubs of esptool")
    )]
    InvalidStubDescriptor(String),

    #[error(transparent)]
    TryFromSlice(#[from] TryFromSliceError),
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Connection-related errors
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esploader::connection_failed),
        help("Ensure that the device is connected and in download mode")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esploader::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(esploader::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    FramingError,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(code(esploader::stub_handshake))]
    InvalidStubHandshake,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esploader::timeout))]
    Timeout(TimedOutCommand),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esploader::serial_error))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => from_error_kind(kind, err),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

fn from_error_kind<E>(kind: io::ErrorKind, err: E) -> ConnectionError
where
    E: Into<serialport::Error>,
{
    match kind {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ConnectionError::Timeout(TimedOutCommand::default())
        }
        io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Status codes returned in the trailer of a loader response
#[derive(Clone, Copy, Debug, Default, Error, Diagnostic, strum::FromRepr, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(esploader::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Loader failed to execute command")]
    #[diagnostic(code(esploader::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(esploader::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Loader failed to write to flash")]
    #[diagnostic(code(esploader::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Loader failed to read from flash")]
    #[diagnostic(code(esploader::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(esploader::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(esploader::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(esploader::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(esploader::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(esploader::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(esploader::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(esploader::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(esploader::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(esploader::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(esploader::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(esploader::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(esploader::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(esploader::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error reported by the loader through the status trailer of a response
#[derive(Clone, Copy, Debug, Error, Diagnostic)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    /// The command the loader rejected.
    pub fn command(&self) -> CommandType {
        self.command
    }

    /// The decoded error code from the status trailer.
    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}
