//! Flasher stub blobs
//!
//! The stub is a small program uploaded to target RAM that replaces the
//! mask-ROM loader with a richer and faster command surface. Its binaries are
//! not part of this crate; they are loaded from the TOML descriptor files
//! shipped with `espflash` (converted from the JSON stubs of `esptool.py`).

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use crate::error::Error;

/// Handshake emitted by a freshly started stub.
pub(crate) const STUB_HANDSHAKE: &[u8] = b"OHAI";

/// On-disk form of a stub descriptor (base64 encoded sections)
#[derive(Debug, Deserialize)]
struct StubDescriptor {
    entry: u32,
    text: String,
    text_start: u32,
    data: String,
    data_start: u32,
}

/// A flasher stub: two loadable sections and an entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashStub {
    entry: u32,
    text_start: u32,
    text: Vec<u8>,
    data_start: u32,
    data: Vec<u8>,
}

impl FlashStub {
    /// Build a stub from already-decoded sections.
    pub fn new(entry: u32, text_start: u32, text: Vec<u8>, data_start: u32, data: Vec<u8>) -> Self {
        FlashStub {
            entry,
            text_start,
            text,
            data_start,
            data,
        }
    }

    /// Parse a TOML stub descriptor.
    pub fn from_toml(descriptor: &str) -> Result<Self, Error> {
        let stub: StubDescriptor = toml::from_str(descriptor)
            .map_err(|err| Error::InvalidStubDescriptor(err.to_string()))?;

        let text = general_purpose::STANDARD
            .decode(&stub.text)
            .map_err(|err| Error::InvalidStubDescriptor(format!("text section: {err}")))?;
        let data = general_purpose::STANDARD
            .decode(&stub.data)
            .map_err(|err| Error::InvalidStubDescriptor(format!("data section: {err}")))?;

        Ok(FlashStub {
            entry: stub.entry,
            text_start: stub.text_start,
            text,
            data_start: stub.data_start,
            data,
        })
    }

    /// Stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Text section start address and bytes
    pub fn text(&self) -> (u32, &[u8]) {
        (self.text_start, &self.text)
    }

    /// Data section start address and bytes
    pub fn data(&self) -> (u32, &[u8]) {
        (self.data_start, &self.data)
    }
}
