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

    src/attribute.rs

    The MFT-style attribute record family: a common little-endian header
    followed by either resident data (payload inline in the record) or a
    non-resident payload (sizes plus a packed run list mapping virtual
    cluster numbers to device clusters). The non-resident flag at byte
    0x08 of the record selects the variant.

    Attribute records are parse-only; nothing in this crate rewrites them.
*/

use std::cmp::Ordering;

use bitflags::bitflags;

use crate::{codec, record::DiskRecord, DiskError};

/// Attribute type codes.
pub mod attr_types {
    pub const STANDARD_INFORMATION: u32 = 0x10;
    pub const ATTRIBUTE_LIST: u32 = 0x20;
    pub const FILE_NAME: u32 = 0x30;
    pub const OBJECT_ID: u32 = 0x40;
    pub const SECURITY_DESCRIPTOR: u32 = 0x50;
    pub const VOLUME_NAME: u32 = 0x60;
    pub const VOLUME_INFORMATION: u32 = 0x70;
    pub const DATA: u32 = 0x80;
    pub const INDEX_ROOT: u32 = 0x90;
    pub const INDEX_ALLOCATION: u32 = 0xA0;
    pub const BITMAP: u32 = 0xB0;
    /// End-of-attributes marker in a file record.
    pub const END: u32 = 0xFFFF_FFFF;
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct AttributeFlags: u16 {
        const COMPRESSED = 0x0001;
        const ENCRYPTED  = 0x4000;
        const SPARSE     = 0x8000;
    }
}

/// One entry of a decoded run list. `offset` is the signed cluster delta
/// from the previous run's start; a missing offset marks a sparse run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataRun {
    pub length: u64,
    pub offset: Option<i64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttributePayload {
    Resident {
        data: Vec<u8>,
    },
    NonResident {
        start_vcn: u64,
        allocated_len: u64,
        data_len: u64,
        initialized_len: u64,
        data_runs: Vec<DataRun>,
    },
}

impl Default for AttributePayload {
    fn default() -> AttributePayload {
        AttributePayload::Resident { data: Vec::new() }
    }
}

/// One attribute record of an MFT-style file record.
///
/// Records within a file sort lexicographically on (type code, name,
/// attribute id); unnamed attributes order before named ones of the same
/// type.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttributeRecord {
    pub type_code: u32,
    pub attribute_id: u16,
    pub name: Option<String>,
    pub flags: AttributeFlags,
    pub payload: AttributePayload,
    record_length: u32,
}

const HEADER_SIZE: usize = 0x10;
const RESIDENT_FIXED_SIZE: usize = 0x18;
const NON_RESIDENT_FIXED_SIZE: usize = 0x40;

impl AttributeRecord {
    /// Parse the attribute record at the head of `buf`, returning it and
    /// the bytes consumed, or None at the end-of-attributes marker.
    pub fn parse(buf: &[u8]) -> Result<Option<(AttributeRecord, usize)>, DiskError> {
        let type_code = codec::read_u32_le(buf)?;
        if type_code == attr_types::END {
            return Ok(None);
        }

        let record_length = codec::read_u32_le(&buf[4..])?;
        let record_len = record_length as usize;
        if record_len < RESIDENT_FIXED_SIZE {
            return Err(DiskError::Corrupt(format!(
                "attribute record length {} below minimum",
                record_len
            )));
        }
        codec::check_len(buf, record_len)?;
        let record = &buf[..record_len];

        let non_resident = record[0x08] != 0;
        let name_length = record[0x09] as usize;
        let name_offset = codec::read_u16_le(&record[0x0A..])? as usize;
        let flags = AttributeFlags::from_bits_retain(codec::read_u16_le(&record[0x0C..])?);
        let attribute_id = codec::read_u16_le(&record[0x0E..])?;

        let name = if name_length > 0 {
            let name_end = name_offset + name_length * 2;
            if name_offset < HEADER_SIZE || name_end > record_len {
                return Err(DiskError::Corrupt("attribute name outside record bounds".to_string()));
            }
            Some(codec::read_utf16_le(&record[name_offset..name_end], false)?)
        }
        else {
            None
        };

        let payload = if non_resident {
            if record_len < NON_RESIDENT_FIXED_SIZE {
                return Err(DiskError::Corrupt(format!(
                    "non-resident attribute record length {} below fixed header",
                    record_len
                )));
            }
            let start_vcn = codec::read_u64_le(&record[0x10..])?;
            let runs_offset = codec::read_u16_le(&record[0x20..])? as usize;
            let allocated_len = codec::read_u64_le(&record[0x28..])?;
            let data_len = codec::read_u64_le(&record[0x30..])?;
            let initialized_len = codec::read_u64_le(&record[0x38..])?;

            if runs_offset < NON_RESIDENT_FIXED_SIZE || runs_offset > record_len {
                return Err(DiskError::Corrupt("attribute run list outside record bounds".to_string()));
            }
            let data_runs = decode_runs(&record[runs_offset..])?;

            AttributePayload::NonResident {
                start_vcn,
                allocated_len,
                data_len,
                initialized_len,
                data_runs,
            }
        }
        else {
            let data_length = codec::read_u32_le(&record[0x10..])? as usize;
            let data_offset = codec::read_u16_le(&record[0x14..])? as usize;
            if data_offset < RESIDENT_FIXED_SIZE || data_offset + data_length > record_len {
                return Err(DiskError::Corrupt("resident attribute data outside record bounds".to_string()));
            }
            AttributePayload::Resident {
                data: record[data_offset..data_offset + data_length].to_vec(),
            }
        };

        Ok(Some((
            AttributeRecord {
                type_code,
                attribute_id,
                name,
                flags,
                payload,
                record_length,
            },
            record_len,
        )))
    }

    /// Parse consecutive attribute records up to the end marker.
    pub fn parse_list(buf: &[u8]) -> Result<Vec<AttributeRecord>, DiskError> {
        let mut records = Vec::new();
        let mut pos = 0usize;
        while let Some((record, consumed)) = AttributeRecord::parse(&buf[pos..])? {
            pos += consumed;
            records.push(record);
        }
        Ok(records)
    }

    pub fn is_non_resident(&self) -> bool {
        matches!(self.payload, AttributePayload::NonResident { .. })
    }

    /// Resolve the run list to absolute cluster extents: (start cluster or
    /// None for sparse runs, cluster count). Run offsets are deltas from
    /// the previous run's start.
    pub fn data_extents(&self) -> Vec<(Option<u64>, u64)> {
        match &self.payload {
            AttributePayload::Resident { .. } => Vec::new(),
            AttributePayload::NonResident { data_runs, .. } => {
                let mut current = 0i64;
                data_runs
                    .iter()
                    .map(|run| match run.offset {
                        Some(delta) => {
                            current += delta;
                            (Some(current as u64), run.length)
                        }
                        None => (None, run.length),
                    })
                    .collect()
            }
        }
    }
}

impl Ord for AttributeRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.type_code
            .cmp(&other.type_code)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.attribute_id.cmp(&other.attribute_id))
    }
}

impl PartialOrd for AttributeRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl DiskRecord for AttributeRecord {
    fn size_bytes(&self) -> usize {
        self.record_length as usize
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize, DiskError> {
        match AttributeRecord::parse(buf)? {
            Some((record, consumed)) => {
                *self = record;
                Ok(consumed)
            }
            None => Err(DiskError::Corrupt("unexpected end-of-attributes marker".to_string())),
        }
    }
}

/// Decode a packed run list. Each run starts with a header byte whose low
/// nibble is the byte width of the length field and whose high nibble is
/// the byte width of the signed offset field (zero for sparse runs); a
/// zero header terminates the list.
fn decode_runs(buf: &[u8]) -> Result<Vec<DataRun>, DiskError> {
    let mut runs = Vec::new();
    let mut pos = 0usize;

    loop {
        if pos >= buf.len() {
            return Err(DiskError::Corrupt("unterminated attribute run list".to_string()));
        }
        let header = buf[pos];
        if header == 0 {
            break;
        }
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(DiskError::Corrupt(format!("invalid run header byte {:#04x}", header)));
        }
        codec::check_len(&buf[pos + 1..], length_size + offset_size)?;

        let mut length = 0u64;
        for (i, &b) in buf[pos + 1..pos + 1 + length_size].iter().enumerate() {
            length |= (b as u64) << (8 * i);
        }

        let offset = if offset_size == 0 {
            None
        }
        else {
            let bytes = &buf[pos + 1 + length_size..pos + 1 + length_size + offset_size];
            let mut value = 0i64;
            for (i, &b) in bytes.iter().enumerate() {
                value |= (b as i64) << (8 * i);
            }
            // Sign-extend from the stored width.
            let shift = 64 - offset_size * 8;
            Some((value << shift) >> shift)
        };

        runs.push(DataRun { length, offset });
        pos += 1 + length_size + offset_size;
    }

    Ok(runs)
}
