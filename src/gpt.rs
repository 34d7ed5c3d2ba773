/*
    diskfox
    https://github.com/dbalsom/diskfox

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/gpt.rs

    GUID Partition Table entries. Each entry is 128 bytes, little-endian,
    with both GUIDs in the Microsoft mixed encoding and a 36-code-unit
    UTF-16LE name slot.
*/

use binrw::{binrw, BinRead, BinWrite};
use bitflags::bitflags;
use strum::{EnumIter, IntoEnumIterator};

use crate::{
    io::{Cursor, ReadSeek, WriteSeek},
    DiskError,
    Guid,
};

pub const GPT_ENTRY_SIZE: usize = 128;

bitflags! {
    /// GPT entry attribute flags. Bits 48..64 are type-specific; the named
    /// high bits here are the Microsoft basic-data ones.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct GptAttributes: u64 {
        const PLATFORM_REQUIRED     = 1 << 0;
        const EFI_IGNORE            = 1 << 1;
        const LEGACY_BIOS_BOOTABLE  = 1 << 2;
        const READ_ONLY             = 1 << 60;
        const SHADOW_COPY           = 1 << 61;
        const HIDDEN                = 1 << 62;
        const NO_DRIVE_LETTER       = 1 << 63;
    }
}

/// Partition type GUIDs this crate knows a friendly name for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumIter)]
pub enum WellKnownPartitionType {
    Unused,
    BiosBoot,
    EfiSystem,
    MicrosoftReserved,
    WindowsBasicData,
    WindowsRe,
    LinuxFileSystem,
    LinuxSwap,
    LinuxLvm,
}

impl WellKnownPartitionType {
    pub fn guid(&self) -> Guid {
        match self {
            WellKnownPartitionType::Unused => Guid::NIL,
            WellKnownPartitionType::BiosBoot => {
                Guid::from_fields(0x21686148, 0x6449, 0x6E6F, [0x74, 0x4E, 0x65, 0x65, 0x64, 0x45, 0x46, 0x49])
            }
            WellKnownPartitionType::EfiSystem => {
                Guid::from_fields(0xC12A7328, 0xF81F, 0x11D2, [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B])
            }
            WellKnownPartitionType::MicrosoftReserved => {
                Guid::from_fields(0xE3C9E316, 0x0B5C, 0x4DB8, [0x81, 0x7D, 0xF9, 0x2D, 0xF0, 0x02, 0x15, 0xAE])
            }
            WellKnownPartitionType::WindowsBasicData => {
                Guid::from_fields(0xEBD0A0A2, 0xB9E5, 0x4433, [0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7])
            }
            WellKnownPartitionType::WindowsRe => {
                Guid::from_fields(0xDE94BBA4, 0x06D1, 0x4D40, [0xA1, 0x6A, 0xBF, 0xD5, 0x01, 0x79, 0xD6, 0xAC])
            }
            WellKnownPartitionType::LinuxFileSystem => {
                Guid::from_fields(0x0FC63DAF, 0x8483, 0x4772, [0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4])
            }
            WellKnownPartitionType::LinuxSwap => {
                Guid::from_fields(0x0657FD6D, 0xA4AB, 0x43C4, [0x84, 0xE5, 0x09, 0x33, 0xC8, 0x4B, 0x4F, 0x4F])
            }
            WellKnownPartitionType::LinuxLvm => {
                Guid::from_fields(0xE6D6D379, 0xF507, 0x44C2, [0xA2, 0x3C, 0x23, 0x8F, 0x2A, 0x3D, 0xF9, 0x28])
            }
        }
    }

    pub fn from_guid(guid: Guid) -> Option<WellKnownPartitionType> {
        WellKnownPartitionType::iter().find(|t| t.guid() == guid)
    }
}

impl std::fmt::Display for WellKnownPartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WellKnownPartitionType::Unused => "Unused",
            WellKnownPartitionType::BiosBoot => "BIOS Boot",
            WellKnownPartitionType::EfiSystem => "EFI System",
            WellKnownPartitionType::MicrosoftReserved => "Microsoft Reserved",
            WellKnownPartitionType::WindowsBasicData => "Windows Basic Data",
            WellKnownPartitionType::WindowsRe => "Windows Recovery Environment",
            WellKnownPartitionType::LinuxFileSystem => "Linux Filesystem",
            WellKnownPartitionType::LinuxSwap => "Linux Swap",
            WellKnownPartitionType::LinuxLvm => "Linux LVM",
        };
        write!(f, "{}", name)
    }
}

/// One 128-byte GPT partition entry.
#[derive(Clone, Debug, PartialEq)]
#[binrw]
#[brw(little)]
pub struct GptEntry {
    partition_type: [u8; 16],
    identity: [u8; 16],
    pub first_lba: i64,
    pub last_lba: i64,
    attributes: u64,
    name_units: [u16; 36],
}

impl Default for GptEntry {
    fn default() -> GptEntry {
        GptEntry {
            partition_type: [0; 16],
            identity: [0; 16],
            first_lba: 0,
            last_lba: 0,
            attributes: 0,
            name_units: [0; 36],
        }
    }
}

impl GptEntry {
    pub fn read<RS: ReadSeek>(stream: &mut RS) -> Result<GptEntry, DiskError> {
        Ok(<GptEntry as BinRead>::read(stream)?)
    }

    pub fn write<WS: WriteSeek>(&self, stream: &mut WS) -> Result<(), DiskError> {
        Ok(<GptEntry as BinWrite>::write(self, stream)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<GptEntry, DiskError> {
        if buf.len() < GPT_ENTRY_SIZE {
            return Err(DiskError::SliceTooShort {
                needed: GPT_ENTRY_SIZE,
                actual: buf.len(),
            });
        }
        GptEntry::read(&mut Cursor::new(&buf[..GPT_ENTRY_SIZE]))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DiskError> {
        let mut cursor = Cursor::new(Vec::with_capacity(GPT_ENTRY_SIZE));
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn partition_type(&self) -> Guid {
        Guid::from_mixed_le_bytes(self.partition_type)
    }

    pub fn set_partition_type(&mut self, guid: Guid) {
        self.partition_type = guid.to_mixed_le_bytes();
    }

    /// The unique GUID of this partition instance.
    pub fn identity(&self) -> Guid {
        Guid::from_mixed_le_bytes(self.identity)
    }

    pub fn set_identity(&mut self, guid: Guid) {
        self.identity = guid.to_mixed_le_bytes();
    }

    pub fn attributes(&self) -> GptAttributes {
        GptAttributes::from_bits_retain(self.attributes)
    }

    pub fn set_attributes(&mut self, attributes: GptAttributes) {
        self.attributes = attributes.bits();
    }

    /// The partition name, with NUL padding stripped.
    pub fn name(&self) -> String {
        let units: Vec<u16> = self.name_units.iter().copied().take_while(|&u| u != 0).collect();
        char::decode_utf16(units).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), DiskError> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > self.name_units.len() {
            return Err(DiskError::SliceTooShort {
                needed: units.len() * 2,
                actual: self.name_units.len() * 2,
            });
        }
        self.name_units = [0; 36];
        self.name_units[..units.len()].copy_from_slice(&units);
        Ok(())
    }

    pub fn is_used(&self) -> bool {
        !self.partition_type().is_nil()
    }

    /// The friendly name of the partition type, or its GUID string when the
    /// type is not a well-known one.
    pub fn friendly_type(&self) -> String {
        match WellKnownPartitionType::from_guid(self.partition_type()) {
            Some(known) => known.to_string(),
            None => self.partition_type().to_string(),
        }
    }
}
