//! SLIP framing for the loader protocol
//!
//! Frames are delimited by 0xC0 on both ends; 0xC0 and 0xDB inside a frame
//! are escaped as 0xDB 0xDC and 0xDB 0xDD.

use std::time::Duration;

use log::debug;

use crate::{error::ConnectionError, interface::Interface};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Encode `payload` as one complete SLIP frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(END);
    for &byte in payload {
        match byte {
            END => frame.extend([ESC, ESC_END]),
            ESC => frame.extend([ESC, ESC_ESC]),
            _ => frame.push(byte),
        }
    }
    frame.push(END);
    frame
}

/// Reads one SLIP frame from the interface.
///
/// Blocks until an opening marker is seen; anything received before it is
/// loader console output and is surfaced through the `log` facade. Empty
/// frames are idle markers and are skipped. Each byte is awaited for at most
/// `timeout`.
pub fn read_frame<I: Interface>(
    interface: &mut I,
    timeout: Duration,
) -> Result<Vec<u8>, ConnectionError> {
    let mut noise: Vec<u8> = Vec::new();
    loop {
        let byte = read_byte(interface, timeout)?;
        if byte == END {
            break;
        }
        noise.push(byte);
    }
    if !noise.is_empty() {
        debug!("Device output: {}", String::from_utf8_lossy(&noise));
    }

    let mut frame: Vec<u8> = Vec::new();
    loop {
        let byte = read_byte(interface, timeout)?;
        match byte {
            END => {
                // Adjacent markers delimit an empty frame, keep waiting.
                if !frame.is_empty() {
                    return Ok(frame);
                }
            }
            ESC => match read_byte(interface, timeout)? {
                ESC_END => frame.push(END),
                ESC_ESC => frame.push(ESC),
                other => {
                    debug!("Invalid escape sequence 0xDB {other:#04x}");
                    return Err(ConnectionError::FramingError);
                }
            },
            other => frame.push(other),
        }
    }
}

fn read_byte<I: Interface>(interface: &mut I, timeout: Duration) -> Result<u8, ConnectionError> {
    let mut byte = [0u8; 1];
    interface.read_exact(&mut byte, timeout)?;
    Ok(byte[0])
}
