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

    src/vhd/mod.rs

    Microsoft Virtual Hard Disk (VHD) support: the on-disk footer, dynamic
    header and parent locator records, and the fixed/dynamic/differencing
    image files built from them.

    All multi-byte fields in VHD structures are big-endian. The footer and
    dynamic header carry a one's-complement byte-sum checksum computed with
    the checksum field itself zeroed.
*/

use bitflags::bitflags;

use crate::{codec, record::DiskRecord, DiskError, Geometry, Guid};

pub mod file;
pub mod stream;

pub use file::VhdFile;
pub use stream::DynamicStream;

pub const FOOTER_SIZE: usize = 512;
pub const DYNAMIC_HEADER_SIZE: usize = 1024;
pub const PARENT_LOCATOR_SIZE: usize = 24;
pub const PARENT_LOCATOR_COUNT: usize = 8;

pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";
pub const DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";

/// Seconds from the Unix epoch to the VHD epoch (2000-01-01T00:00:00Z).
pub const VHD_EPOCH_OFFSET: u64 = 946_684_800;

/// Platform code for a Windows relative path, stored as UTF-16LE.
pub const PLATFORM_CODE_WINDOWS_RELATIVE: &str = "W2ru";
/// Platform code for a Windows absolute path, stored as UTF-16LE.
pub const PLATFORM_CODE_WINDOWS_ABSOLUTE: &str = "W2ku";
/// An unused locator slot.
pub const PLATFORM_CODE_NONE: &str = "\0\0\0\0";

bitflags! {
    /// Footer feature flags. The "reserved" bit is always set by Microsoft
    /// tools.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FooterFeatures: u32 {
        const TEMPORARY = 0b0000_0001;
        const RESERVED  = 0b0000_0010;
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(u32)]
pub enum VhdDiskType {
    #[default]
    None = 0,
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl VhdDiskType {
    pub fn from_u32(value: u32) -> Result<VhdDiskType, DiskError> {
        match value {
            0 => Ok(VhdDiskType::None),
            2 => Ok(VhdDiskType::Fixed),
            3 => Ok(VhdDiskType::Dynamic),
            4 => Ok(VhdDiskType::Differencing),
            _ => Err(DiskError::Corrupt(format!("unknown VHD disk type {}", value))),
        }
    }
}

/// One's-complement byte-sum checksum over a record image. The caller
/// zeroes the checksum slot before summing.
fn checksum(buf: &[u8]) -> u32 {
    !buf.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// The 512-byte footer present at the end of every VHD file (and mirrored
/// at offset zero in dynamic and differencing files).
#[derive(Clone, Debug, PartialEq)]
pub struct Footer {
    pub features: FooterFeatures,
    pub format_version: u32,
    /// Offset of the dynamic header, or `u64::MAX` for fixed images.
    pub data_offset: u64,
    /// Creation time in seconds since the VHD epoch.
    pub timestamp: u32,
    pub creator_app: String,
    pub creator_version: u32,
    pub creator_host: String,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: VhdDiskType,
    pub unique_id: Guid,
    pub saved_state: bool,
}

impl Default for Footer {
    fn default() -> Footer {
        Footer {
            features: FooterFeatures::RESERVED,
            format_version: 0x0001_0000,
            data_offset: u64::MAX,
            timestamp: 0,
            creator_app: "dfox".to_string(),
            creator_version: 0x0000_0002,
            creator_host: "Wi2k".to_string(),
            original_size: 0,
            current_size: 0,
            geometry: Geometry::default(),
            disk_type: VhdDiskType::None,
            unique_id: Guid::NIL,
            saved_state: false,
        }
    }
}

impl Footer {
    pub fn new(disk_type: VhdDiskType, capacity: u64, unique_id: Guid, timestamp: u32) -> Footer {
        Footer {
            timestamp,
            original_size: capacity,
            current_size: capacity,
            geometry: Geometry::from_capacity(capacity),
            disk_type,
            unique_id,
            ..Footer::default()
        }
    }
}

impl DiskRecord for Footer {
    fn size_bytes(&self) -> usize {
        FOOTER_SIZE
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize, DiskError> {
        codec::check_len(buf, FOOTER_SIZE)?;
        if &buf[0..8] != FOOTER_COOKIE {
            return Err(DiskError::Corrupt("VHD footer cookie missing".to_string()));
        }

        let mut scratch = [0u8; FOOTER_SIZE];
        scratch.copy_from_slice(&buf[..FOOTER_SIZE]);
        scratch[64..68].fill(0);
        let stored_sum = codec::read_u32_be(&buf[64..])?;
        if checksum(&scratch) != stored_sum {
            return Err(DiskError::Corrupt(format!(
                "VHD footer checksum mismatch (stored {:#010x})",
                stored_sum
            )));
        }

        self.features = FooterFeatures::from_bits_retain(codec::read_u32_be(&buf[8..])?);
        self.format_version = codec::read_u32_be(&buf[12..])?;
        self.data_offset = codec::read_u64_be(&buf[16..])?;
        self.timestamp = codec::read_u32_be(&buf[24..])?;
        self.creator_app = codec::read_tag(&buf[28..])?;
        self.creator_version = codec::read_u32_be(&buf[32..])?;
        self.creator_host = codec::read_tag(&buf[36..])?;
        self.original_size = codec::read_u64_be(&buf[40..])?;
        self.current_size = codec::read_u64_be(&buf[48..])?;
        self.geometry = Geometry::new(codec::read_u16_be(&buf[56..])?, buf[58], buf[59]);
        self.disk_type = VhdDiskType::from_u32(codec::read_u32_be(&buf[60..])?)?;
        self.unique_id = codec::read_guid_be(&buf[68..])?;
        self.saved_state = buf[84] != 0;
        Ok(FOOTER_SIZE)
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<usize, DiskError> {
        codec::check_len(buf, FOOTER_SIZE)?;
        buf[..FOOTER_SIZE].fill(0);
        buf[0..8].copy_from_slice(FOOTER_COOKIE);
        codec::write_u32_be(&mut buf[8..], self.features.bits())?;
        codec::write_u32_be(&mut buf[12..], self.format_version)?;
        codec::write_u64_be(&mut buf[16..], self.data_offset)?;
        codec::write_u32_be(&mut buf[24..], self.timestamp)?;
        codec::write_tag(&mut buf[28..32], &self.creator_app)?;
        codec::write_u32_be(&mut buf[32..], self.creator_version)?;
        codec::write_tag(&mut buf[36..40], &self.creator_host)?;
        codec::write_u64_be(&mut buf[40..], self.original_size)?;
        codec::write_u64_be(&mut buf[48..], self.current_size)?;
        codec::write_u16_be(&mut buf[56..], self.geometry.c())?;
        buf[58] = self.geometry.h();
        buf[59] = self.geometry.s();
        codec::write_u32_be(&mut buf[60..], self.disk_type as u32)?;
        codec::write_guid_be(&mut buf[68..], self.unique_id)?;
        buf[84] = self.saved_state as u8;

        let sum = checksum(&buf[..FOOTER_SIZE]);
        codec::write_u32_be(&mut buf[64..], sum)?;
        Ok(FOOTER_SIZE)
    }
}

/// A parent locator entry in the dynamic header: where in the file one
/// platform-specific rendering of the parent path lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParentLocator {
    pub platform_code: String,
    /// Bytes reserved in the file for the platform data.
    pub platform_data_space: u32,
    /// Bytes of meaningful platform data.
    pub platform_data_length: u32,
    /// Absolute file offset of the platform data.
    pub platform_data_offset: i64,
}

impl Default for ParentLocator {
    fn default() -> ParentLocator {
        ParentLocator {
            platform_code: PLATFORM_CODE_NONE.to_string(),
            platform_data_space: 0,
            platform_data_length: 0,
            platform_data_offset: 0,
        }
    }
}

impl ParentLocator {
    pub fn is_used(&self) -> bool {
        self.platform_code != PLATFORM_CODE_NONE && !self.platform_code.is_empty()
    }
}

impl DiskRecord for ParentLocator {
    fn size_bytes(&self) -> usize {
        PARENT_LOCATOR_SIZE
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize, DiskError> {
        codec::check_len(buf, PARENT_LOCATOR_SIZE)?;
        self.platform_code = codec::read_tag(buf)?;
        self.platform_data_space = codec::read_u32_be(&buf[4..])?;
        self.platform_data_length = codec::read_u32_be(&buf[8..])?;
        self.platform_data_offset = codec::read_i64_be(&buf[16..])?;
        Ok(PARENT_LOCATOR_SIZE)
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<usize, DiskError> {
        codec::check_len(buf, PARENT_LOCATOR_SIZE)?;
        buf[..PARENT_LOCATOR_SIZE].fill(0);
        codec::write_tag(&mut buf[0..4], &self.platform_code)?;
        codec::write_u32_be(&mut buf[4..], self.platform_data_space)?;
        codec::write_u32_be(&mut buf[8..], self.platform_data_length)?;
        codec::write_i64_be(&mut buf[16..], self.platform_data_offset)?;
        Ok(PARENT_LOCATOR_SIZE)
    }
}

/// The 1024-byte header of dynamic and differencing images, pointed at by
/// the footer's data offset.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicHeader {
    /// Offset of the block allocation table.
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_unique_id: Guid,
    pub parent_timestamp: u32,
    /// The parent's file name, stored as UTF-16BE.
    pub parent_unicode_name: String,
    pub parent_locators: [ParentLocator; PARENT_LOCATOR_COUNT],
}

impl Default for DynamicHeader {
    fn default() -> DynamicHeader {
        DynamicHeader {
            table_offset: 0,
            header_version: 0x0001_0000,
            max_table_entries: 0,
            block_size: 0x0020_0000,
            parent_unique_id: Guid::NIL,
            parent_timestamp: 0,
            parent_unicode_name: String::new(),
            parent_locators: Default::default(),
        }
    }
}

impl DiskRecord for DynamicHeader {
    fn size_bytes(&self) -> usize {
        DYNAMIC_HEADER_SIZE
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize, DiskError> {
        codec::check_len(buf, DYNAMIC_HEADER_SIZE)?;
        if &buf[0..8] != DYNAMIC_COOKIE {
            return Err(DiskError::Corrupt("VHD dynamic header cookie missing".to_string()));
        }

        let mut scratch = [0u8; DYNAMIC_HEADER_SIZE];
        scratch.copy_from_slice(&buf[..DYNAMIC_HEADER_SIZE]);
        scratch[36..40].fill(0);
        let stored_sum = codec::read_u32_be(&buf[36..])?;
        if checksum(&scratch) != stored_sum {
            return Err(DiskError::Corrupt(format!(
                "VHD dynamic header checksum mismatch (stored {:#010x})",
                stored_sum
            )));
        }

        self.table_offset = codec::read_u64_be(&buf[16..])?;
        self.header_version = codec::read_u32_be(&buf[24..])?;
        self.max_table_entries = codec::read_u32_be(&buf[28..])?;
        self.block_size = codec::read_u32_be(&buf[32..])?;
        self.parent_unique_id = codec::read_guid_be(&buf[40..])?;
        self.parent_timestamp = codec::read_u32_be(&buf[56..])?;
        self.parent_unicode_name = codec::read_utf16_be(&buf[64..576], true)?;
        for (i, locator) in self.parent_locators.iter_mut().enumerate() {
            locator.read_from(&buf[576 + i * PARENT_LOCATOR_SIZE..])?;
        }
        Ok(DYNAMIC_HEADER_SIZE)
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<usize, DiskError> {
        codec::check_len(buf, DYNAMIC_HEADER_SIZE)?;
        buf[..DYNAMIC_HEADER_SIZE].fill(0);
        buf[0..8].copy_from_slice(DYNAMIC_COOKIE);
        codec::write_u64_be(&mut buf[8..], u64::MAX)?;
        codec::write_u64_be(&mut buf[16..], self.table_offset)?;
        codec::write_u32_be(&mut buf[24..], self.header_version)?;
        codec::write_u32_be(&mut buf[28..], self.max_table_entries)?;
        codec::write_u32_be(&mut buf[32..], self.block_size)?;
        codec::write_guid_be(&mut buf[40..], self.parent_unique_id)?;
        codec::write_u32_be(&mut buf[56..], self.parent_timestamp)?;
        codec::write_utf16_be(&mut buf[64..576], &self.parent_unicode_name)?;
        for (i, locator) in self.parent_locators.iter().enumerate() {
            locator.write_to(&mut buf[576 + i * PARENT_LOCATOR_SIZE..])?;
        }

        let sum = checksum(&buf[..DYNAMIC_HEADER_SIZE]);
        codec::write_u32_be(&mut buf[36..], sum)?;
        Ok(DYNAMIC_HEADER_SIZE)
    }
}
