//! A library for driving the serial bootloader of Espressif devices.
//!
//! `esploader` speaks the SLIP-framed command protocol implemented by the
//! mask-ROM loader and the flasher stub of ESP32-family SoCs. It detects the
//! attached chip, uploads a flasher stub to RAM, and programs or reads back
//! the external flash.
//!
//! The entry point is [`flasher::Flasher`], which owns a
//! [`connection::Connection`] over any [`interface::Interface`]
//! implementation. A typical session:
//!
//! ```no_run
//! use esploader::flasher::Flasher;
//! use esploader::interface::SerialInterface;
//!
//! # fn main() -> Result<(), esploader::Error> {
//! let port = serialport::new("/dev/ttyUSB0", 115_200).open()?;
//! let mut flasher = Flasher::new(SerialInterface::new(port));
//!
//! flasher.sync()?;
//! let chip_id = flasher.detect()?;
//! println!("connected to chip {chip_id:#010x}");
//! # Ok(())
//! # }
//! ```
//!
//! Stub blobs are not bundled with this crate; load them from the descriptor
//! files shipped with `esptool`/`espflash` via
//! [`flasher::stub::FlashStub::from_toml`].

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod interface;
pub mod target;

pub use crate::error::Error;
