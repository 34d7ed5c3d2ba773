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

    src/vhd/file.rs

    An opened VHD image file: footer and dynamic header parsing, parent
    location hints, creation of new fixed/dynamic/differencing files, and
    the ChainLayer glue that lets VHD files participate in differencing
    chains.
*/

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    chain::ChainLayer,
    codec,
    ownership::{Ownership, SharedStream, StreamRef},
    record::DiskRecord,
    sparse::{layered::LayeredStream, SparseStream, SubStream},
    vhd::{
        stream::DynamicStream,
        DynamicHeader,
        Footer,
        ParentLocator,
        VhdDiskType,
        DYNAMIC_HEADER_SIZE,
        FOOTER_SIZE,
        PLATFORM_CODE_WINDOWS_ABSOLUTE,
        PLATFORM_CODE_WINDOWS_RELATIVE,
        VHD_EPOCH_OFFSET,
    },
    DiskError,
    Guid,
    SECTOR_SIZE,
};

/// Seconds since the VHD epoch, for stamping newly created images.
fn vhd_timestamp_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs().saturating_sub(VHD_EPOCH_OFFSET) as u32)
}

fn pad_to_sector(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE as u64) * SECTOR_SIZE as u64
}

/// An opened VHD image file of any flavor.
pub struct VhdFile {
    stream: StreamRef,
    footer: Footer,
    dynamic_header: Option<DynamicHeader>,
    hints: Vec<String>,
    path: String,
}

impl VhdFile {
    /// Open an image over `stream`. The file handle is closed on teardown
    /// iff `ownership` is `Dispose`. `path` is recorded for hint
    /// resolution and error messages only.
    pub fn open(stream: SharedStream, ownership: Ownership, path: &str) -> Result<VhdFile, DiskError> {
        let len = stream.len();
        if len < FOOTER_SIZE as u64 {
            return Err(DiskError::Corrupt(format!("{}: file too short for a VHD footer", path)));
        }

        let mut buf = [0u8; FOOTER_SIZE];
        stream.read_exact_at(len - FOOTER_SIZE as u64, &mut buf)?;
        let mut footer = Footer::default();
        if let Err(e) = footer.read_from(&buf) {
            // Fall back to the header copy kept at the front of sparse
            // images, in case the trailing footer was truncated.
            log::warn!("{}: trailing footer unreadable ({}), trying front copy", path, e);
            stream.read_exact_at(0, &mut buf)?;
            footer.read_from(&buf)?;
        }

        if footer.disk_type == VhdDiskType::None {
            return Err(DiskError::Corrupt(format!("{}: image has no disk type", path)));
        }

        let dynamic_header = match footer.disk_type {
            VhdDiskType::Fixed => None,
            _ => {
                let mut buf = [0u8; DYNAMIC_HEADER_SIZE];
                stream.read_exact_at(footer.data_offset, &mut buf)?;
                let mut header = DynamicHeader::default();
                header.read_from(&buf)?;
                Some(header)
            }
        };

        let hints = match &dynamic_header {
            Some(header) => read_parent_hints(&stream, header)?,
            None => Vec::new(),
        };

        Ok(VhdFile {
            stream: StreamRef::new(stream, ownership),
            footer,
            dynamic_header,
            hints,
            path: path.to_string(),
        })
    }

    /// Create a fixed image of `capacity` bytes on `stream` and open it.
    pub fn create_fixed(
        stream: SharedStream,
        capacity: u64,
        unique_id: Guid,
        ownership: Ownership,
        path: &str,
    ) -> Result<VhdFile, DiskError> {
        let footer = Footer::new(VhdDiskType::Fixed, capacity, unique_id, vhd_timestamp_now());
        let mut buf = [0u8; FOOTER_SIZE];
        footer.write_to(&mut buf)?;
        stream.write_all_at(capacity, &buf)?;
        VhdFile::open(stream, ownership, path)
    }

    /// Create a dynamic image of `capacity` bytes on `stream` and open it.
    /// No blocks are allocated; the whole virtual extent reads as zeros.
    pub fn create_dynamic(
        stream: SharedStream,
        capacity: u64,
        block_size: u32,
        unique_id: Guid,
        ownership: Ownership,
        path: &str,
    ) -> Result<VhdFile, DiskError> {
        let header = DynamicHeader {
            table_offset: (FOOTER_SIZE + DYNAMIC_HEADER_SIZE) as u64,
            max_table_entries: capacity.div_ceil(block_size as u64) as u32,
            block_size,
            ..DynamicHeader::default()
        };
        let mut footer = Footer::new(VhdDiskType::Dynamic, capacity, unique_id, vhd_timestamp_now());
        footer.data_offset = FOOTER_SIZE as u64;

        write_sparse_skeleton(&stream, &footer, &header, &[])?;
        VhdFile::open(stream, ownership, path)
    }

    /// Create a differencing image over `parent` on `stream` and open it.
    /// The parent is referenced by fingerprint plus two Windows locator
    /// entries: a relative and an absolute path.
    pub fn create_differencing(
        stream: SharedStream,
        parent: &VhdFile,
        parent_relative: &str,
        parent_absolute: &str,
        unique_id: Guid,
        ownership: Ownership,
        path: &str,
    ) -> Result<VhdFile, DiskError> {
        let capacity = parent.footer.current_size;
        let block_size = parent
            .dynamic_header
            .as_ref()
            .map_or_else(|| DynamicHeader::default().block_size, |h| h.block_size);

        let parent_name = parent_relative.rsplit(['\\', '/']).next().unwrap_or(parent_relative);
        let mut header = DynamicHeader {
            table_offset: (FOOTER_SIZE + DYNAMIC_HEADER_SIZE) as u64,
            max_table_entries: capacity.div_ceil(block_size as u64) as u32,
            block_size,
            parent_unique_id: parent.unique_id(),
            parent_timestamp: parent.footer.timestamp,
            parent_unicode_name: parent_name.to_string(),
            ..DynamicHeader::default()
        };

        // Locator platform data lands in reserved sectors after the BAT.
        let bat_bytes = pad_to_sector(header.max_table_entries as u64 * 4);
        let locator_base = header.table_offset + bat_bytes;
        let mut locator_payloads = Vec::new();
        for (i, (code, parent_path)) in [
            (PLATFORM_CODE_WINDOWS_RELATIVE, parent_relative),
            (PLATFORM_CODE_WINDOWS_ABSOLUTE, parent_absolute),
        ]
        .into_iter()
        .enumerate()
        {
            let mut payload = vec![0u8; SECTOR_SIZE];
            let length = codec::write_utf16_le(&mut payload, parent_path)?;
            let offset = locator_base + (i * SECTOR_SIZE) as u64;
            header.parent_locators[i] = ParentLocator {
                platform_code: code.to_string(),
                platform_data_space: SECTOR_SIZE as u32,
                platform_data_length: length as u32,
                platform_data_offset: offset as i64,
            };
            locator_payloads.push((offset, payload));
        }

        let mut footer = Footer::new(VhdDiskType::Differencing, capacity, unique_id, vhd_timestamp_now());
        footer.data_offset = FOOTER_SIZE as u64;

        write_sparse_skeleton(&stream, &footer, &header, &locator_payloads)?;
        VhdFile::open(stream, ownership, path)
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn dynamic_header(&self) -> Option<&DynamicHeader> {
        self.dynamic_header.as_ref()
    }

    pub fn disk_type(&self) -> VhdDiskType {
        self.footer.disk_type
    }

    pub fn is_closed(&self) -> bool {
        self.stream.stream().is_closed()
    }
}

/// Lay a sparse image skeleton onto `stream`: footer copy at the front,
/// dynamic header, an empty BAT, any locator payloads, and the footer again
/// at the end of the file.
fn write_sparse_skeleton(
    stream: &SharedStream,
    footer: &Footer,
    header: &DynamicHeader,
    locator_payloads: &[(u64, Vec<u8>)],
) -> Result<(), DiskError> {
    let mut footer_buf = [0u8; FOOTER_SIZE];
    footer.write_to(&mut footer_buf)?;
    let mut header_buf = [0u8; DYNAMIC_HEADER_SIZE];
    header.write_to(&mut header_buf)?;

    let bat_bytes = pad_to_sector(header.max_table_entries as u64 * 4);
    let bat = vec![0xFFu8; bat_bytes as usize];

    stream.write_all_at(0, &footer_buf)?;
    stream.write_all_at(footer.data_offset, &header_buf)?;
    stream.write_all_at(header.table_offset, &bat)?;

    let mut end = header.table_offset + bat_bytes;
    for (offset, payload) in locator_payloads {
        stream.write_all_at(*offset, payload)?;
        end = end.max(offset + payload.len() as u64);
    }

    stream.write_all_at(end, &footer_buf)?;
    Ok(())
}

/// Decode the parent location hints recorded in a dynamic header, in
/// stored order, followed by the parent's unicode file name.
fn read_parent_hints(stream: &SharedStream, header: &DynamicHeader) -> Result<Vec<String>, DiskError> {
    let mut hints = Vec::new();
    for locator in &header.parent_locators {
        if !locator.is_used() || locator.platform_data_length == 0 || locator.platform_data_offset < 0 {
            continue;
        }
        match locator.platform_code.as_str() {
            PLATFORM_CODE_WINDOWS_RELATIVE | PLATFORM_CODE_WINDOWS_ABSOLUTE => {
                let mut data = vec![0u8; locator.platform_data_length as usize];
                stream.read_exact_at(locator.platform_data_offset as u64, &mut data)?;
                let path = codec::read_utf16_le(&data, true)?;
                if !path.is_empty() {
                    hints.push(path);
                }
            }
            other => {
                log::debug!("ignoring parent locator with platform code {:?}", other);
            }
        }
    }
    if !header.parent_unicode_name.is_empty() {
        hints.push(header.parent_unicode_name.clone());
    }
    Ok(hints)
}

impl ChainLayer for VhdFile {
    fn unique_id(&self) -> Guid {
        self.footer.unique_id
    }

    fn parent_unique_id(&self) -> Guid {
        self.dynamic_header.as_ref().map_or(Guid::NIL, |h| h.parent_unique_id)
    }

    fn needs_parent(&self) -> bool {
        self.footer.disk_type == VhdDiskType::Differencing
    }

    fn capacity(&self) -> u64 {
        self.footer.current_size
    }

    fn full_path(&self) -> String {
        self.path.clone()
    }

    fn parent_location_hints(&self) -> Vec<String> {
        self.hints.clone()
    }

    fn open_content(&mut self, parent: Option<StreamRef>) -> Result<Box<dyn SparseStream>, DiskError> {
        match self.footer.disk_type {
            VhdDiskType::Fixed => {
                reject_parent(parent, &self.path)?;
                let window = SubStream::new(StreamRef::borrowed(self.stream.stream()), 0, self.footer.current_size)?;
                Ok(Box::new(window))
            }
            VhdDiskType::Dynamic => {
                reject_parent(parent, &self.path)?;
                let header = self.expect_dynamic_header()?;
                let writable = self.stream.stream().can_write();
                let stream =
                    DynamicStream::open(self.stream.stream().clone(), &header, self.footer.current_size, writable)?;
                Ok(Box::new(stream))
            }
            VhdDiskType::Differencing => {
                let parent = parent.ok_or_else(|| {
                    DiskError::Corrupt(format!("{}: differencing image opened without a parent stream", self.path))
                })?;
                if parent.stream().len() != self.footer.current_size {
                    return Err(DiskError::Corrupt(format!(
                        "{}: parent stream length {:#x} does not match capacity {:#x}",
                        self.path,
                        parent.stream().len(),
                        self.footer.current_size
                    )));
                }

                let header = self.expect_dynamic_header()?;
                let writable = self.stream.stream().can_write();
                let top =
                    DynamicStream::open(self.stream.stream().clone(), &header, self.footer.current_size, writable)?;
                let stack = LayeredStream::with_granularity(
                    vec![StreamRef::owned(Box::new(top)), parent],
                    SECTOR_SIZE as u64,
                )?;
                Ok(Box::new(stack))
            }
            VhdDiskType::None => Err(DiskError::Corrupt(format!("{}: image has no disk type", self.path))),
        }
    }

    fn close(&mut self) {
        self.stream.release();
    }
}

impl VhdFile {
    fn expect_dynamic_header(&self) -> Result<DynamicHeader, DiskError> {
        self.dynamic_header
            .clone()
            .ok_or_else(|| DiskError::Corrupt(format!("{}: sparse image is missing its dynamic header", self.path)))
    }
}

fn reject_parent(parent: Option<StreamRef>, path: &str) -> Result<(), DiskError> {
    if parent.is_some() {
        return Err(DiskError::Corrupt(format!(
            "{}: self-contained image handed a parent stream",
            path
        )));
    }
    Ok(())
}
