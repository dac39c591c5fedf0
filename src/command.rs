//! Commands understood by the ROM loader and the flasher stub
//!
//! Every request is the 8-byte header followed by a fixed parameter block
//! and, for the DATA-bearing commands, a data region. [Command::encode]
//! produces the complete request; the header checksum covers the data region
//! only.

use std::time::Duration;

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

/// Value of the direction byte in a request header.
pub const DIRECTION_REQUEST: u8 = 0;
/// Value of the direction byte in a response header.
pub const DIRECTION_RESPONSE: u8 = 1;
/// Size of the command header on the wire.
pub const HEADER_SIZE: usize = 8;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const FLASH_DEFLATE_END_TIMEOUT: Duration = Duration::from_secs(10);
const FLASH_MD5_TIMEOUT: Duration = Duration::from_secs(8);

/// SYNC payload: 0x07 0x07 0x12 0x20 followed by 32 copies of 0x55.
const SYNC_PAYLOAD: [u8; 36] = {
    let mut payload = [0x55u8; 36];
    payload[0] = 0x07;
    payload[1] = 0x07;
    payload[2] = 0x12;
    payload[3] = 0x20;
    payload
};

/// Types of commands that can be sent to a target device
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    // Commands supported by every loader
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    // Supported by ESP32-S2 and later
    GetSecurityInfo = 0x14,
    // Stub-only commands
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
    ReadFlash = 0xD2,
    RunUserCode = 0xD3,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFLATE_END_TIMEOUT,
            CommandType::FlashMd5 => FLASH_MD5_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout scaled to the amount of data the command touches
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                FLASH_DEFLATE_END_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin | CommandType::EraseRegion => {
                calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                calc_timeout(ERASE_WRITE_TIMEOUT_PER_MB, size)
            }
            _ => self.timeout(),
        }
    }

    /// Does the response to this command end in a status trailer?
    ///
    /// SYNC replies are matched on their header alone, and the Security Info
    /// record is returned without a trailer by loaders that predate it.
    pub fn expects_status(&self) -> bool {
        !matches!(self, CommandType::Sync | CommandType::GetSecurityInfo)
    }
}

/// SPI flash pin assignment carried by SPI_ATTACH
///
/// The five pin numbers are packed six bits each into a single argument
/// word. All zeros selects the default pin set of the chip, which is correct
/// for every supported target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpiPins {
    pub clk: u8,
    pub q: u8,
    pub d: u8,
    pub hd: u8,
    pub cs: u8,
}

impl SpiPins {
    fn packed(self) -> u32 {
        u32::from(self.hd) << 24
            | u32::from(self.cs) << 18
            | u32::from(self.d) << 12
            | u32::from(self.q) << 6
            | u32::from(self.clk)
    }
}

/// Geometry of the attached SPI flash chip
///
/// Sent with SPI_SET_PARAMS so the loader knows the erase and write
/// granularity of the part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Zeroable, Pod)]
#[repr(C)]
pub struct SpiFlashParams {
    pub id: u32,
    pub total_size: u32,
    pub block_size: u32,
    pub sector_size: u32,
    pub page_size: u32,
    pub status_mask: u32,
}

impl SpiFlashParams {
    /// Standard geometry for a flash of `total_size` bytes.
    pub const fn with_size(total_size: u32) -> Self {
        SpiFlashParams {
            id: 0,
            total_size,
            block_size: 0x1_0000,
            sector_size: 0x1000,
            page_size: 0x100,
            status_mask: 0xFFFF,
        }
    }
}

/// Parameter block of the begin commands, shared by the RAM, flash and
/// deflate paths
#[derive(Zeroable, Pod, Copy, Clone)]
#[repr(C)]
struct TransferParams {
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
}

/// Block header preceding the data region of a DATA command
#[derive(Zeroable, Pod, Copy, Clone)]
#[repr(C)]
struct BlockHeader {
    size: u32,
    sequence: u32,
    reserved: [u32; 2],
}

#[derive(Zeroable, Pod, Copy, Clone)]
#[repr(C)]
struct EntryParams {
    no_entry: u32,
    entry: u32,
}

#[derive(Zeroable, Pod, Copy, Clone)]
#[repr(C)]
struct WriteRegParams {
    address: u32,
    value: u32,
    mask: u32,
    delay_us: u32,
}

#[derive(Zeroable, Pod, Copy, Clone)]
#[repr(C)]
struct ReadFlashParams {
    offset: u32,
    size: u32,
    packet_size: u32,
    max_in_flight: u32,
}

/// Available commands
///
/// Commands differ only in their parameter block and whether they carry a
/// data region; the request header layout is shared.
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        params: SpiFlashParams,
    },
    SpiAttach {
        pins: SpiPins,
        stub: bool,
    },
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    GetSecurityInfo,
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
    ReadFlash {
        offset: u32,
        size: u32,
        packet_size: u32,
        max_in_flight: u32,
    },
    RunUserCode,
}

impl<'a> Command<'a> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::MemData { .. } => CommandType::MemData,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::GetSecurityInfo => CommandType::GetSecurityInfo,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
            Command::ReadFlash { .. } => CommandType::ReadFlash,
            Command::RunUserCode => CommandType::RunUserCode,
        }
    }

    /// Serialize the complete request: header, parameter block, data region.
    pub fn encode(&self) -> Vec<u8> {
        let (params, data) = self.payload();
        let checksum = if data.is_empty() {
            0
        } else {
            u32::from(xor_checksum(data))
        };

        let mut request = Vec::with_capacity(HEADER_SIZE + params.len() + data.len());
        request.push(DIRECTION_REQUEST);
        request.push(self.command_type() as u8);
        request.extend(((params.len() + data.len()) as u16).to_le_bytes());
        request.extend(checksum.to_le_bytes());
        request.extend_from_slice(&params);
        request.extend_from_slice(data);
        request
    }

    /// Parameter block and data region of the request.
    fn payload(&self) -> (Vec<u8>, &'a [u8]) {
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            }
            | Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
            } => (
                bytes_of(&TransferParams {
                    size,
                    blocks,
                    block_size,
                    offset,
                })
                .to_vec(),
                &[],
            ),
            Command::FlashData { data, sequence }
            | Command::MemData { data, sequence }
            | Command::FlashDeflData { data, sequence } => (
                bytes_of(&BlockHeader {
                    size: data.len() as u32,
                    sequence,
                    reserved: [0; 2],
                })
                .to_vec(),
                data,
            ),
            // 0 reboots into the application, 1 stays in the loader
            Command::FlashEnd { reboot } | Command::FlashDeflEnd { reboot } => {
                (u32::from(!reboot).to_le_bytes().to_vec(), &[])
            }
            Command::MemEnd { no_entry, entry } => (
                bytes_of(&EntryParams {
                    no_entry: u32::from(no_entry),
                    entry,
                })
                .to_vec(),
                &[],
            ),
            Command::Sync => (SYNC_PAYLOAD.to_vec(), &[]),
            Command::WriteReg {
                address,
                value,
                mask,
            } => (
                bytes_of(&WriteRegParams {
                    address,
                    value,
                    mask: mask.unwrap_or(u32::MAX),
                    delay_us: 0,
                })
                .to_vec(),
                &[],
            ),
            Command::ReadReg { address } => (address.to_le_bytes().to_vec(), &[]),
            Command::SpiSetParams { params } => (bytes_of(&params).to_vec(), &[]),
            Command::SpiAttach { pins, stub } => {
                let mut params = pins.packed().to_le_bytes().to_vec();
                // the ROM loader takes an extra word the stub dropped
                if !stub {
                    params.extend([0u8; 4]);
                }
                (params, &[])
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                let mut params = new_baud.to_le_bytes().to_vec();
                params.extend(prior_baud.to_le_bytes());
                (params, &[])
            }
            Command::FlashMd5 { offset, size } => {
                let mut params = offset.to_le_bytes().to_vec();
                params.extend(size.to_le_bytes());
                params.extend([0u8; 8]);
                (params, &[])
            }
            Command::EraseRegion { offset, size } => {
                let mut params = offset.to_le_bytes().to_vec();
                params.extend(size.to_le_bytes());
                (params, &[])
            }
            Command::ReadFlash {
                offset,
                size,
                packet_size,
                max_in_flight,
            } => (
                bytes_of(&ReadFlashParams {
                    offset,
                    size,
                    packet_size,
                    max_in_flight,
                })
                .to_vec(),
                &[],
            ),
            Command::GetSecurityInfo | Command::EraseFlash | Command::RunUserCode => {
                (Vec::new(), &[])
            }
        }
    }
}

/// Seed of the request checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// XOR checksum of a data region.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_SEED, |sum, byte| sum ^ byte)
}
