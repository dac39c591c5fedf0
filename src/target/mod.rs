//! Supported target devices
//!
//! Chip identity and the per-chip transfer attributes consulted by the
//! flashing operations. Profiles are immutable values resolved from the chip
//! ID reported by the loader's Security Info record.

use strum::{Display, EnumIter, EnumString, VariantNames};

/// Address of the chip-detect magic register.
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-P4
    Esp32p4,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
}

impl Chip {
    /// Returns the chip ID for the [Chip]
    pub fn id(&self) -> u16 {
        self.profile().chip_id
    }

    /// Create a [Chip] from a value read from the chip-detect magic register.
    pub fn from_magic(magic: u32) -> Result<Self, crate::Error> {
        PROFILES
            .iter()
            .find(|profile| profile.magic_values.contains(&magic))
            .map(|profile| profile.chip)
            .ok_or_else(|| {
                crate::Error::ChipDetectError(format!("unrecognized magic value: {magic:#x}"))
            })
    }

    /// The ROM-loader profile of this chip.
    pub fn profile(&self) -> &'static ChipProfile {
        match self {
            Chip::Esp32c2 => &ESP32C2,
            Chip::Esp32c3 => &ESP32C3,
            Chip::Esp32c6 => &ESP32C6,
            Chip::Esp32p4 => &ESP32P4,
            Chip::Esp32s2 => &ESP32S2,
            Chip::Esp32s3 => &ESP32S3,
        }
    }
}

impl TryFrom<u16> for Chip {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        ChipProfile::find(value)
            .map(|profile| profile.chip)
            .ok_or(crate::Error::UnsupportedChip(value))
    }
}

/// Transfer attributes of one chip family, as one loader generation sees them
///
/// The `stub` companion profile exists for chips whose flasher stub changes
/// the attributes once it is running.
#[derive(Debug)]
pub struct ChipProfile {
    /// The chip this profile belongs to.
    pub chip: Chip,
    /// Low 16 bits of the chip ID word in the Security Info record.
    pub chip_id: u16,
    /// Known values of the chip-detect magic register.
    pub magic_values: &'static [u32],
    /// Maximum bytes per MEM_DATA payload.
    pub ram_block: u32,
    /// Bytes per FLASH_DATA / DEFL_DATA payload.
    pub flash_block: u32,
    /// Width of the status trailer on responses, 2 or 4 bytes.
    pub status_len: usize,
    /// Whether the loader implements GET_SECURITY_INFO.
    pub supports_security_info: bool,
    /// Profile to switch to once the flasher stub is running.
    stub: Option<&'static ChipProfile>,
}

const RAM_BLOCK: u32 = 0x1800;
const FLASH_BLOCK: u32 = 0x4000;

pub(crate) static ESP32C2: ChipProfile = ChipProfile {
    chip: Chip::Esp32c2,
    chip_id: 12,
    magic_values: &[
        0x6f51_306f, // ECO0
        0x7c41_a06f, // ECO1
    ],
    ram_block: RAM_BLOCK,
    flash_block: FLASH_BLOCK,
    status_len: 4,
    supports_security_info: true,
    stub: None,
};

pub(crate) static ESP32C3: ChipProfile = ChipProfile {
    chip: Chip::Esp32c3,
    chip_id: 5,
    magic_values: &[
        0x6921_506f, // ECO1 + ECO2
        0x1b31_506f, // ECO3
        0x4881_606f, // ECO6
        0x4361_606f, // ECO7
    ],
    ram_block: RAM_BLOCK,
    flash_block: FLASH_BLOCK,
    status_len: 4,
    supports_security_info: true,
    stub: None,
};

pub(crate) static ESP32C6: ChipProfile = ChipProfile {
    chip: Chip::Esp32c6,
    chip_id: 13,
    magic_values: &[0x2ce0_806f],
    ram_block: RAM_BLOCK,
    flash_block: FLASH_BLOCK,
    status_len: 4,
    supports_security_info: true,
    stub: Some(&ESP32C6_STUB),
};

// The ESP32-C6 stub answers with the short status trailer.
pub(crate) static ESP32C6_STUB: ChipProfile = ChipProfile {
    chip: Chip::Esp32c6,
    chip_id: 13,
    magic_values: &[0x2ce0_806f],
    ram_block: RAM_BLOCK,
    flash_block: FLASH_BLOCK,
    status_len: 2,
    supports_security_info: true,
    stub: None,
};

pub(crate) static ESP32P4: ChipProfile = ChipProfile {
    chip: Chip::Esp32p4,
    chip_id: 18,
    magic_values: &[0x0, 0x0add_bad0],
    ram_block: RAM_BLOCK,
    flash_block: FLASH_BLOCK,
    status_len: 4,
    supports_security_info: true,
    stub: None,
};

pub(crate) static ESP32S2: ChipProfile = ChipProfile {
    chip: Chip::Esp32s2,
    chip_id: 2,
    magic_values: &[0x0000_07c6],
    ram_block: RAM_BLOCK,
    flash_block: FLASH_BLOCK,
    status_len: 4,
    supports_security_info: true,
    stub: None,
};

pub(crate) static ESP32S3: ChipProfile = ChipProfile {
    chip: Chip::Esp32s3,
    chip_id: 9,
    magic_values: &[0x9],
    ram_block: RAM_BLOCK,
    flash_block: FLASH_BLOCK,
    status_len: 4,
    supports_security_info: true,
    stub: None,
};

static PROFILES: &[&ChipProfile] = &[
    &ESP32C2, &ESP32C3, &ESP32C6, &ESP32P4, &ESP32S2, &ESP32S3,
];

impl ChipProfile {
    /// Look up the ROM-loader profile for the low 16 bits of a chip ID.
    pub fn find(chip_id: u16) -> Option<&'static ChipProfile> {
        PROFILES
            .iter()
            .copied()
            .find(|profile| profile.chip_id == chip_id)
    }

    /// The profile in effect once the flasher stub is running.
    pub fn stub_profile(&'static self) -> &'static ChipProfile {
        self.stub.unwrap_or(self)
    }
}
