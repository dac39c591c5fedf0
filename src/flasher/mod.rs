//! Flashing operations on a target device
//!
//! The [Flasher] struct owns a [Connection] and tracks the session state:
//! whether the loader has been synchronized, which chip was detected, and
//! whether the flasher stub has been started. All programming and read-back
//! operations live here.

use std::{io::Write, thread::sleep, time::Duration};

use flate2::{write::ZlibEncoder, Compression};
use log::{debug, info, warn};
use md5::{Digest, Md5};

use crate::{
    command::{Command, CommandType, SpiFlashParams, SpiPins, DEFAULT_TIMEOUT},
    connection::Connection,
    error::{ConnectionError, Error},
    flasher::stub::{FlashStub, STUB_HANDSHAKE},
    interface::Interface,
    target::{Chip, ChipProfile, CHIP_DETECT_MAGIC_REG_ADDR},
};

pub mod stub;

pub(crate) const FLASH_SECTOR_SIZE: usize = 0x1000;

/// Number of READ_FLASH packets the stub may send ahead of our acks.
const READ_FLASH_MAX_IN_FLIGHT: u32 = 64;

/// Security Info record reported by loaders of the ESP32-S2 and later
#[derive(Debug, Clone, Copy)]
pub struct SecurityInfo {
    pub flags: u32,
    pub key_count: u8,
    pub key_purposes: [u8; 7],
    pub chip_id: u32,
}

impl TryFrom<&[u8]> for SecurityInfo {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 16 {
            return Err(Error::InvalidResponse(format!(
                "security info record of {} bytes, expected at least 16",
                bytes.len()
            )));
        }

        Ok(SecurityInfo {
            flags: u32::from_le_bytes(bytes[0..4].try_into()?),
            key_count: bytes[4],
            key_purposes: bytes[5..12].try_into()?,
            chip_id: u32::from_le_bytes(bytes[12..16].try_into()?),
        })
    }
}

/// A flashing session with a single target device
///
/// The session moves through `sync` → `detect` → (optionally) `run_stub`;
/// operations that need a chip profile or the stub fail cleanly when called
/// too early. A successful [Flasher::mem_finish] or [Flasher::run_user_code]
/// hands the target over to user code and ends the session's usefulness.
pub struct Flasher<I: Interface> {
    connection: Connection<I>,
    profile: Option<&'static ChipProfile>,
    chip_id: Option<u32>,
    synced: bool,
    stub_running: bool,
}

impl<I: Interface> Flasher<I> {
    /// Create a session bound to a serial interface.
    pub fn new(interface: I) -> Self {
        Flasher {
            connection: Connection::new(interface),
            profile: None,
            chip_id: None,
            synced: false,
            stub_running: false,
        }
    }

    /// Access the underlying connection.
    pub fn connection(&mut self) -> &mut Connection<I> {
        &mut self.connection
    }

    /// The detected chip, if any.
    pub fn chip(&self) -> Option<Chip> {
        self.profile.map(|profile| profile.chip)
    }

    /// The full chip ID word from the Security Info record, once detected.
    pub fn chip_id(&self) -> Option<u32> {
        self.chip_id
    }

    /// Is the flasher stub running on the target?
    pub fn stub_running(&self) -> bool {
        self.stub_running
    }

    /// Wait for the ROM loader and synchronize with it.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.connection.wait_for_download_mode()?;
        self.connection.sync()?;
        self.synced = true;
        Ok(())
    }

    /// Identify the attached chip from its Security Info record.
    ///
    /// Returns the chip ID word. An unrecognized chip ID is only a warning
    /// here; operations that need the chip profile will fail with
    /// [Error::UnsupportedChip] later.
    pub fn detect(&mut self) -> Result<u32, Error> {
        if !self.synced {
            return Err(Error::SyncRequired);
        }

        let response = self.connection.command(Command::GetSecurityInfo)?;
        let security_info = SecurityInfo::try_from(response.body.as_slice())?;
        debug!("Security info: {security_info:x?}");

        let chip_id = security_info.chip_id;
        self.chip_id = Some(chip_id);

        match ChipProfile::find((chip_id & 0xffff) as u16) {
            Some(profile) => {
                info!("Detected {}", profile.chip);
                self.connection.set_status_len(profile.status_len);
                self.profile = Some(profile);
            }
            None => warn!("Unknown chip ID {:#06x}", chip_id & 0xffff),
        }

        Ok(chip_id)
    }

    /// Read the chip-detect magic register.
    pub fn read_magic(&mut self) -> Result<u32, Error> {
        self.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)
    }

    /// Upload the flasher stub to RAM and start it.
    ///
    /// The stub announces itself with a handshake frame; anything else fails
    /// with [ConnectionError::InvalidStubHandshake] and the session should be
    /// considered inconsistent.
    pub fn run_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        let profile = self.profile()?;

        let (text_start, text) = stub.text();
        info!(
            "Uploading flasher stub text @ {:#010x} ({:#x} bytes)",
            text_start,
            text.len()
        );
        self.mem_write(text_start, text)?;

        let (data_start, data) = stub.data();
        info!(
            "Uploading flasher stub data @ {:#010x} ({:#x} bytes)",
            data_start,
            data.len()
        );
        self.mem_write(data_start, data)?;

        info!("Starting flasher stub, entry point {:#010x}", stub.entry());
        self.connection.command(Command::MemEnd {
            no_entry: false,
            entry: stub.entry(),
        })?;

        let handshake = self.connection.read_frame(DEFAULT_TIMEOUT)?;
        if handshake != STUB_HANDSHAKE {
            debug!("Unexpected response from stub: {handshake:02x?}");
            return Err(Error::Connection(ConnectionError::InvalidStubHandshake));
        }
        info!("Stub responded correctly");

        let stub_profile = profile.stub_profile();
        if !std::ptr::eq(stub_profile, profile) {
            warn!("Switched to the {} stub profile", stub_profile.chip);
            self.connection.set_status_len(stub_profile.status_len);
            self.profile = Some(stub_profile);
        }
        self.stub_running = true;

        Ok(())
    }

    /// Write to a range of target RAM.
    pub fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let profile = self.profile()?;
        let block_size = profile.ram_block as usize;
        let blocks = data.len().div_ceil(block_size);
        debug!("Writing {:#x} bytes to RAM at {:#010x}", data.len(), addr);

        self.connection.command(Command::MemBegin {
            size: data.len() as u32,
            blocks: blocks as u32,
            block_size: block_size as u32,
            offset: addr,
        })?;

        for (sequence, chunk) in data.chunks(block_size).enumerate() {
            self.connection.command(Command::MemData {
                data: chunk,
                sequence: sequence as u32,
            })?;
        }

        Ok(())
    }

    /// Finish a RAM write, jumping to `entry` unless it is zero.
    ///
    /// Jumping to user code terminates the download session; the target will
    /// not answer further commands until it is reset.
    pub fn mem_finish(&mut self, entry: u32) -> Result<(), Error> {
        debug!("Mem end, entry point {entry:#010x}");
        self.connection.command(Command::MemEnd {
            no_entry: entry == 0,
            entry,
        })?;

        if entry != 0 {
            self.synced = false;
            self.stub_running = false;
        }

        Ok(())
    }

    /// Write uncompressed data to flash at `offset`.
    ///
    /// Erases `data.len()` bytes as a side effect. Follow up with
    /// [Flasher::flash_finish] once all regions are written.
    pub fn flash_write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let profile = self.profile()?;
        let block_size = profile.flash_block as usize;
        let blocks = data.len().div_ceil(block_size);
        debug!("Writing {:#x} bytes to flash at {:#010x}", data.len(), offset);

        self.connection.command_with_timeout(
            Command::FlashBegin {
                size: data.len() as u32,
                blocks: blocks as u32,
                block_size: block_size as u32,
                offset,
            },
            CommandType::FlashBegin.timeout_for_size(data.len() as u32),
        )?;

        for (sequence, chunk) in data.chunks(block_size).enumerate() {
            self.connection.command_with_timeout(
                Command::FlashData {
                    data: chunk,
                    sequence: sequence as u32,
                },
                CommandType::FlashData.timeout_for_size(chunk.len() as u32),
            )?;
        }

        Ok(())
    }

    /// Leave the flash write state, rebooting the target if requested.
    pub fn flash_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.connection.command(Command::FlashEnd { reboot })?;
        Ok(())
    }

    /// Compress `data` and write it to flash at `offset`.
    ///
    /// The device inflates the stream as it programs; the erase region covers
    /// the uncompressed size. Follow up with
    /// [Flasher::flash_deflate_finish].
    pub fn flash_write_deflate(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let profile = self.profile()?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        debug!(
            "Writing {:#x} bytes to flash at {:#010x} ({:#x} compressed)",
            data.len(),
            offset,
            compressed.len()
        );

        let block_size = profile.flash_block as usize;
        let blocks = compressed.len().div_ceil(block_size);

        self.connection.command_with_timeout(
            Command::FlashDeflBegin {
                size: data.len() as u32,
                blocks: blocks as u32,
                block_size: block_size as u32,
                offset,
            },
            CommandType::FlashDeflBegin.timeout_for_size(data.len() as u32),
        )?;

        for (sequence, chunk) in compressed.chunks(block_size).enumerate() {
            self.connection.command_with_timeout(
                Command::FlashDeflData {
                    data: chunk,
                    sequence: sequence as u32,
                },
                CommandType::FlashDeflData.timeout_for_size(chunk.len() as u32),
            )?;
        }

        Ok(())
    }

    /// Leave the deflate write state, rebooting the target if requested.
    pub fn flash_deflate_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.connection.command(Command::FlashDeflEnd { reboot })?;
        Ok(())
    }

    /// Read back a range of flash, verified end-to-end with an MD5 digest.
    ///
    /// Only available with the stub running. The stub streams sector-sized
    /// frames which are acknowledged with the cumulative received count, then
    /// sends the digest of the whole range.
    pub fn read_flash(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, Error> {
        self.require_stub()?;
        if length == 0 {
            return Err(Error::InvalidArgument(
                "read length must be nonzero".into(),
            ));
        }
        debug!("Reading {length:#x} bytes of flash at {offset:#010x}");

        self.connection.command(Command::ReadFlash {
            offset,
            size: length,
            packet_size: FLASH_SECTOR_SIZE as u32,
            max_in_flight: READ_FLASH_MAX_IN_FLIGHT,
        })?;

        let mut data: Vec<u8> = Vec::with_capacity(length as usize);
        while data.len() < length as usize {
            let chunk = self.connection.read_frame(CommandType::ReadFlash.timeout())?;
            if data.len() + chunk.len() < length as usize && chunk.len() < FLASH_SECTOR_SIZE {
                return Err(Error::CorruptData(FLASH_SECTOR_SIZE, chunk.len()));
            }
            data.extend_from_slice(&chunk);

            self.connection.write_raw(data.len() as u32)?;
            debug!("Reading flash... {} of {} bytes", data.len(), length);
        }

        if data.len() > length as usize {
            return Err(Error::ReadMoreThanExpected);
        }

        let digest = self.connection.read_frame(CommandType::ReadFlash.timeout())?;
        if digest.len() != 16 {
            return Err(Error::IncorrectDigestLength(digest.len()));
        }

        let mut hasher = Md5::new();
        hasher.update(&data);
        let checksum = hasher.finalize();

        if digest != checksum[..] {
            return Err(Error::DigestMismatch(digest, checksum.to_vec()));
        }

        Ok(data)
    }

    /// Erase the entire flash. Stub only; may take tens of seconds.
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        self.require_stub()?;
        debug!("Erasing the entire flash");
        self.connection.command(Command::EraseFlash)?;
        Ok(())
    }

    /// Erase a sector-aligned region of flash. Stub only.
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        self.require_stub()?;
        if offset % FLASH_SECTOR_SIZE as u32 != 0 || size % FLASH_SECTOR_SIZE as u32 != 0 {
            return Err(Error::InvalidEraseRegionArgument { offset, size });
        }
        debug!("Erasing {size:#x} bytes at {offset:#010x}");

        self.connection.command_with_timeout(
            Command::EraseRegion { offset, size },
            CommandType::EraseRegion.timeout_for_size(size),
        )?;
        Ok(())
    }

    /// Ask the device for the MD5 digest of a flash region.
    pub fn checksum_md5(&mut self, offset: u32, length: u32) -> Result<[u8; 16], Error> {
        let response = self.connection.command_with_timeout(
            Command::FlashMd5 {
                offset,
                size: length,
            },
            CommandType::FlashMd5.timeout_for_size(length),
        )?;

        let body = response.body;
        match body.len() {
            // the stub answers with the raw digest
            16 => Ok(body.as_slice().try_into()?),
            // the ROM loader answers with ASCII hex
            32 => {
                let text = std::str::from_utf8(&body)
                    .map_err(|_| Error::InvalidResponse("MD5 digest is not ASCII hex".into()))?;
                let mut digest = [0u8; 16];
                for (i, byte) in digest.iter_mut().enumerate() {
                    *byte = u8::from_str_radix(&text[2 * i..2 * i + 2], 16)
                        .map_err(|_| Error::InvalidResponse("MD5 digest is not ASCII hex".into()))?;
                }
                Ok(digest)
            }
            n => Err(Error::IncorrectDigestLength(n)),
        }
    }

    /// Read a register on the device.
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        self.connection.read_reg(address)
    }

    /// Write a register on the device.
    pub fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.connection.write_reg(address, value, mask)
    }

    /// Attach the SPI flash. Required on some boards before flash commands.
    pub fn spi_attach(&mut self, pins: SpiPins) -> Result<(), Error> {
        self.profile()?;
        self.connection.command(Command::SpiAttach {
            pins,
            stub: self.stub_running,
        })?;
        Ok(())
    }

    /// Configure the geometry of the attached SPI flash chip.
    pub fn spi_set_params(&mut self, params: SpiFlashParams) -> Result<(), Error> {
        self.profile()?;
        self.connection.command(Command::SpiSetParams { params })?;
        Ok(())
    }

    /// Negotiate a new baud rate with the stub, then reconfigure the link.
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.require_stub()?;
        debug!("Change baud to {baud}");

        let prior_baud = self.connection.baud()?;
        self.connection.command(Command::ChangeBaudrate {
            new_baud: baud,
            prior_baud,
        })?;

        // The device switches as soon as it has replied; give it a moment
        // before the next command goes out at the new rate.
        self.connection.set_baud(baud)?;
        sleep(Duration::from_millis(50));

        Ok(())
    }

    /// Reconfigure the local link baud rate without telling the device.
    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.connection.set_baud(baud)
    }

    /// Leave the stub and run whatever is in flash. Stub only.
    pub fn run_user_code(&mut self) -> Result<(), Error> {
        self.require_stub()?;
        self.connection.command(Command::RunUserCode)?;
        self.synced = false;
        self.stub_running = false;
        Ok(())
    }

    fn profile(&self) -> Result<&'static ChipProfile, Error> {
        match (self.profile, self.chip_id) {
            (Some(profile), _) => Ok(profile),
            (None, Some(chip_id)) => Err(Error::UnsupportedChip((chip_id & 0xffff) as u16)),
            (None, None) => Err(Error::ChipNotDetected),
        }
    }

    fn require_stub(&self) -> Result<(), Error> {
        if self.stub_running {
            Ok(())
        } else {
            Err(Error::StubRequired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::HEADER_SIZE;
    use crate::interface::mock::MockInterface;

    fn flasher() -> Flasher<MockInterface> {
        Flasher::new(MockInterface::new())
    }

    fn detected(chip: Chip) -> Flasher<MockInterface> {
        let mut flasher = flasher();
        let profile = chip.profile();
        flasher.synced = true;
        flasher.chip_id = Some(profile.chip_id as u32);
        flasher.profile = Some(profile);
        flasher.connection.set_status_len(profile.status_len);
        flasher
    }

    fn with_stub(chip: Chip) -> Flasher<MockInterface> {
        let mut flasher = detected(chip);
        let profile = chip.profile().stub_profile();
        flasher.profile = Some(profile);
        flasher.connection.set_status_len(profile.status_len);
        flasher.stub_running = true;
        flasher
    }

    fn rom_ok() -> [u8; 4] {
        [0, 0, 0, 0]
    }

    #[test]
    fn sync_then_detect_selects_profile() {
        let mut flasher = flasher();
        let mock = flasher.connection.mock();
        mock.queue_bytes(b"waiting for download\r\n");
        mock.queue_response(0x08, 0, &[0x00, 0x00, 0x55, 0x55]);

        flasher.sync().unwrap();

        let mut body = [0u8; 16];
        body[12..16].copy_from_slice(&0x0000_000Du32.to_le_bytes());
        flasher.connection.mock().queue_response(0x14, 0, &body);

        let chip_id = flasher.detect().unwrap();
        assert_eq!(chip_id, 0x0D);
        assert_eq!(flasher.chip(), Some(Chip::Esp32c6));
        assert_eq!(flasher.connection.status_len(), 4);
    }

    #[test]
    fn detect_requires_sync() {
        let mut flasher = flasher();
        assert!(matches!(flasher.detect().unwrap_err(), Error::SyncRequired));
    }

    #[test]
    fn detect_rejects_short_record() {
        let mut flasher = flasher();
        flasher.synced = true;
        flasher.connection.mock().queue_response(0x14, 0, &[0u8; 8]);

        let err = flasher.detect().unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[test]
    fn unknown_chip_is_a_deferred_failure() {
        let mut flasher = flasher();
        flasher.synced = true;
        let mut body = [0u8; 16];
        body[12..16].copy_from_slice(&0x0000_4242u32.to_le_bytes());
        flasher.connection.mock().queue_response(0x14, 0, &body);

        // detection itself succeeds
        assert_eq!(flasher.detect().unwrap(), 0x4242);
        assert_eq!(flasher.chip(), None);

        // but anything needing a profile does not
        let err = flasher.mem_write(0x4000_0000, &[0]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedChip(0x4242)));
    }

    #[test]
    fn mem_write_splits_into_ram_blocks() {
        let mut flasher = detected(Chip::Esp32s3);
        let mock = flasher.connection.mock();
        mock.queue_response(0x05, 0, &rom_ok());
        for _ in 0..4 {
            mock.queue_response(0x07, 0, &rom_ok());
        }

        let data: Vec<u8> = (0..0x5000u32).map(|i| i as u8).collect();
        flasher.mem_write(0x3FFE_0000, &data).unwrap();

        let frames = flasher.connection.mock().written_frames();
        assert_eq!(frames.len(), 5);

        // MEM_BEGIN: size, blocks, block size, address
        let begin = &frames[0];
        assert_eq!(begin[1], 0x05);
        assert_eq!(&begin[8..12], &0x5000u32.to_le_bytes());
        assert_eq!(&begin[12..16], &4u32.to_le_bytes());
        assert_eq!(&begin[16..20], &0x1800u32.to_le_bytes());
        assert_eq!(&begin[20..24], &0x3FFE_0000u32.to_le_bytes());

        // MEM_DATA blocks cover the input exactly, in sequence order
        let mut reassembled = Vec::new();
        let expected_lengths = [0x1800usize, 0x1800, 0x1800, 0x0800];
        for (i, frame) in frames[1..].iter().enumerate() {
            assert_eq!(frame[1], 0x07);
            let chunk = &frame[HEADER_SIZE + 16..];
            assert_eq!(chunk.len(), expected_lengths[i]);
            assert_eq!(
                &frame[HEADER_SIZE..HEADER_SIZE + 4],
                &(chunk.len() as u32).to_le_bytes()
            );
            assert_eq!(
                &frame[HEADER_SIZE + 4..HEADER_SIZE + 8],
                &(i as u32).to_le_bytes()
            );
            reassembled.extend_from_slice(chunk);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn flash_write_uses_flash_blocks() {
        let mut flasher = detected(Chip::Esp32c3);
        let mock = flasher.connection.mock();
        mock.queue_response(0x02, 0, &rom_ok());
        mock.queue_response(0x03, 0, &rom_ok());
        mock.queue_response(0x03, 0, &rom_ok());

        let data = vec![0xA5u8; 0x4001];
        flasher.flash_write(0x1_0000, &data).unwrap();

        let frames = flasher.connection.mock().written_frames();
        assert_eq!(frames.len(), 3);

        let begin = &frames[0];
        assert_eq!(begin[1], 0x02);
        assert_eq!(&begin[8..12], &0x4001u32.to_le_bytes());
        assert_eq!(&begin[12..16], &2u32.to_le_bytes());
        assert_eq!(&begin[16..20], &0x4000u32.to_le_bytes());

        assert_eq!(frames[1][HEADER_SIZE + 16..].len(), 0x4000);
        assert_eq!(frames[2][HEADER_SIZE + 16..].len(), 1);
    }

    #[test]
    fn flash_write_deflate_sends_compressed_stream() {
        let mut flasher = detected(Chip::Esp32c3);
        let mock = flasher.connection.mock();
        mock.queue_response(0x10, 0, &rom_ok());
        // compressible data fits one block
        mock.queue_response(0x11, 0, &rom_ok());

        let data = vec![0x5Au8; 0x9000];
        flasher.flash_write_deflate(0x2_0000, &data).unwrap();

        let frames = flasher.connection.mock().written_frames();
        assert_eq!(frames.len(), 2);

        // DEFL_BEGIN erase size is the uncompressed length
        let begin = &frames[0];
        assert_eq!(begin[1], 0x10);
        assert_eq!(&begin[8..12], &0x9000u32.to_le_bytes());
        assert_eq!(&begin[12..16], &1u32.to_le_bytes());

        // the stream inflates back to the original
        let compressed = &frames[1][HEADER_SIZE + 16..];
        let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
        decoder.write_all(compressed).unwrap();
        assert_eq!(decoder.finish().unwrap(), data);
    }

    #[test]
    fn flash_finish_reboot_flag() {
        let mut flasher = detected(Chip::Esp32c3);
        flasher.connection.mock().queue_response(0x04, 0, &rom_ok());

        flasher.flash_finish(false).unwrap();

        let frames = flasher.connection.mock().written_frames();
        assert_eq!(&frames[0][8..], &1u32.to_le_bytes());
    }

    #[test]
    fn run_stub_handshake_and_c6_profile_swap() {
        let mut flasher = detected(Chip::Esp32c6);
        let mock = flasher.connection.mock();
        // text upload: begin + one block
        mock.queue_response(0x05, 0, &rom_ok());
        mock.queue_response(0x07, 0, &rom_ok());
        // data upload: begin + one block
        mock.queue_response(0x05, 0, &rom_ok());
        mock.queue_response(0x07, 0, &rom_ok());
        // entry
        mock.queue_response(0x06, 0, &rom_ok());
        mock.queue_frame(b"OHAI");

        let stub = FlashStub::new(
            0x4038_0000,
            0x4038_0000,
            vec![1, 2, 3, 4],
            0x3FCA_0000,
            vec![5, 6],
        );
        flasher.run_stub(&stub).unwrap();

        assert!(flasher.stub_running());
        // the C6 stub answers with the short status trailer
        assert_eq!(flasher.connection.status_len(), 2);
    }

    #[test]
    fn run_stub_rejects_bad_handshake() {
        let mut flasher = detected(Chip::Esp32c3);
        let mock = flasher.connection.mock();
        mock.queue_response(0x05, 0, &rom_ok());
        mock.queue_response(0x07, 0, &rom_ok());
        mock.queue_response(0x05, 0, &rom_ok());
        mock.queue_response(0x07, 0, &rom_ok());
        mock.queue_response(0x06, 0, &rom_ok());
        mock.queue_frame(b"NOPE");

        let stub = FlashStub::new(0x4038_0000, 0x4038_0000, vec![1], 0x3FCA_0000, vec![2]);
        let err = flasher.run_stub(&stub).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::InvalidStubHandshake)
        ));
        assert!(!flasher.stub_running());
    }

    #[test]
    fn read_flash_happy_path_acks_and_verifies() {
        let mut flasher = with_stub(Chip::Esp32c6);
        let mock = flasher.connection.mock();
        mock.queue_response(0xD2, 0, &[0, 0]);

        let part1 = vec![0x11u8; 0x1000];
        let part2 = vec![0x22u8; 0x1000];
        mock.queue_frame(&part1);
        mock.queue_frame(&part2);

        let mut hasher = Md5::new();
        hasher.update(&part1);
        hasher.update(&part2);
        let digest = hasher.finalize();
        mock.queue_frame(&digest[..]);

        let data = flasher.read_flash(0x0, 0x2000).unwrap();
        assert_eq!(&data[..0x1000], part1.as_slice());
        assert_eq!(&data[0x1000..], part2.as_slice());

        // one command frame, then strictly increasing acks ending at length
        let frames = flasher.connection.mock().written_frames();
        assert_eq!(frames.len(), 3);
        let acks: Vec<u32> = frames[1..]
            .iter()
            .map(|frame| u32::from_le_bytes(frame.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(acks, vec![0x1000, 0x2000]);
    }

    #[test]
    fn read_flash_detects_digest_mismatch() {
        let mut flasher = with_stub(Chip::Esp32c6);
        let mock = flasher.connection.mock();
        mock.queue_response(0xD2, 0, &[0, 0]);
        mock.queue_frame(&[0x33u8; 0x1000]);
        mock.queue_frame(&[0u8; 16]);

        let err = flasher.read_flash(0x0, 0x1000).unwrap_err();
        assert!(matches!(err, Error::DigestMismatch(_, _)));
    }

    #[test]
    fn read_flash_rejects_short_packet() {
        let mut flasher = with_stub(Chip::Esp32c6);
        let mock = flasher.connection.mock();
        mock.queue_response(0xD2, 0, &[0, 0]);
        mock.queue_frame(&[0x44u8; 0x80]);

        let err = flasher.read_flash(0x0, 0x2000).unwrap_err();
        assert!(matches!(err, Error::CorruptData(0x1000, 0x80)));
    }

    #[test]
    fn read_flash_rejects_bad_digest_length() {
        let mut flasher = with_stub(Chip::Esp32c6);
        let mock = flasher.connection.mock();
        mock.queue_response(0xD2, 0, &[0, 0]);
        mock.queue_frame(&[0x55u8; 0x1000]);
        mock.queue_frame(&[0u8; 8]);

        let err = flasher.read_flash(0x0, 0x1000).unwrap_err();
        assert!(matches!(err, Error::IncorrectDigestLength(8)));
    }

    #[test]
    fn stub_only_operations_are_gated() {
        let mut flasher = detected(Chip::Esp32c6);

        assert!(matches!(
            flasher.read_flash(0, 0x1000).unwrap_err(),
            Error::StubRequired
        ));
        assert!(matches!(
            flasher.erase_flash().unwrap_err(),
            Error::StubRequired
        ));
        assert!(matches!(
            flasher.erase_region(0, 0x1000).unwrap_err(),
            Error::StubRequired
        ));
        assert!(matches!(
            flasher.change_baud(921_600).unwrap_err(),
            Error::StubRequired
        ));
        assert!(matches!(
            flasher.run_user_code().unwrap_err(),
            Error::StubRequired
        ));

        // nothing went out on the wire and the session state is intact
        assert!(flasher.connection.mock().written_frames().is_empty());
        assert_eq!(flasher.chip(), Some(Chip::Esp32c6));
    }

    #[test]
    fn operations_require_detection() {
        let mut flasher = flasher();
        assert!(matches!(
            flasher.mem_write(0, &[0]).unwrap_err(),
            Error::ChipNotDetected
        ));
        assert!(matches!(
            flasher.flash_write(0, &[0]).unwrap_err(),
            Error::ChipNotDetected
        ));
    }

    #[test]
    fn erase_region_validates_alignment() {
        let mut flasher = with_stub(Chip::Esp32c6);

        let err = flasher.erase_region(0x800, 0x1000).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidEraseRegionArgument {
                offset: 0x800,
                size: 0x1000
            }
        ));
        assert!(flasher.connection.mock().written_frames().is_empty());
    }

    #[test]
    fn erase_region_sends_offset_and_size() {
        let mut flasher = with_stub(Chip::Esp32c6);
        flasher.connection.mock().queue_response(0xD1, 0, &[0, 0]);

        flasher.erase_region(0x1_0000, 0x2000).unwrap();

        let frames = flasher.connection.mock().written_frames();
        assert_eq!(frames[0][1], 0xD1);
        assert_eq!(&frames[0][8..12], &0x1_0000u32.to_le_bytes());
        assert_eq!(&frames[0][12..16], &0x2000u32.to_le_bytes());
    }

    #[test]
    fn checksum_md5_parses_both_loader_flavors() {
        // stub flavor: raw digest, short trailer
        let mut flasher = with_stub(Chip::Esp32c6);
        let mut body = vec![0xABu8; 16];
        body.extend([0, 0]);
        flasher.connection.mock().queue_response(0x13, 0, &body);
        assert_eq!(flasher.checksum_md5(0, 0x1000).unwrap(), [0xAB; 16]);

        // ROM flavor: ASCII hex digest, wide trailer
        let mut flasher = detected(Chip::Esp32s3);
        let mut body = b"0123456789abcdef0123456789abcdef".to_vec();
        body.extend([0, 0, 0, 0]);
        flasher.connection.mock().queue_response(0x13, 0, &body);
        assert_eq!(
            flasher.checksum_md5(0, 0x1000).unwrap(),
            [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB,
             0xCD, 0xEF]
        );
    }

    #[test]
    fn change_baud_reconfigures_the_link() {
        let mut flasher = with_stub(Chip::Esp32c6);
        flasher.connection.mock().queue_response(0x0F, 0, &[0, 0]);

        flasher.change_baud(921_600).unwrap();

        assert_eq!(flasher.connection.baud().unwrap(), 921_600);
        let frames = flasher.connection.mock().written_frames();
        assert_eq!(&frames[0][8..12], &921_600u32.to_le_bytes());
        assert_eq!(&frames[0][12..16], &115_200u32.to_le_bytes());
    }

    #[test]
    fn mem_finish_jumps_and_ends_the_session() {
        let mut flasher = detected(Chip::Esp32c3);
        flasher.connection.mock().queue_response(0x06, 0, &rom_ok());

        flasher.mem_finish(0x4200_0000).unwrap();

        let frames = flasher.connection.mock().written_frames();
        assert_eq!(&frames[0][8..12], &0u32.to_le_bytes());
        assert_eq!(&frames[0][12..16], &0x4200_0000u32.to_le_bytes());
        assert!(!flasher.synced);
    }

    #[test]
    fn security_info_parses_fixed_offsets() {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&0x0000_0001u32.to_le_bytes());
        bytes[4] = 7;
        bytes[5..12].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        bytes[12..16].copy_from_slice(&0x0000_0009u32.to_le_bytes());

        let info = SecurityInfo::try_from(bytes.as_slice()).unwrap();
        assert_eq!(info.flags, 1);
        assert_eq!(info.key_count, 7);
        assert_eq!(info.key_purposes, [1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(info.chip_id, 9);
    }
}
