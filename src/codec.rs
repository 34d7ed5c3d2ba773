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

    src/codec.rs

    Byte-slice codec for on-disk structures: fixed-width integers in either
    endianness, GUIDs in both on-disk encodings, UTF-16 string slots, and
    Latin-1 four-byte tags. Structure parsers compose these at fixed offsets
    rather than open-coding byte shuffling.

    Every function is total on slices of sufficient length and fails with
    SliceTooShort otherwise.
*/

use crate::{DiskError, Guid};

/// Verify that `buf` holds at least `needed` bytes.
#[inline]
pub fn check_len(buf: &[u8], needed: usize) -> Result<(), DiskError> {
    if buf.len() < needed {
        Err(DiskError::SliceTooShort {
            needed,
            actual: buf.len(),
        })
    }
    else {
        Ok(())
    }
}

macro_rules! int_codec {
    ($read_le:ident, $read_be:ident, $write_le:ident, $write_be:ident, $ty:ty) => {
        #[inline]
        pub fn $read_le(buf: &[u8]) -> Result<$ty, DiskError> {
            const N: usize = std::mem::size_of::<$ty>();
            check_len(buf, N)?;
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(&buf[..N]);
            Ok(<$ty>::from_le_bytes(bytes))
        }

        #[inline]
        pub fn $read_be(buf: &[u8]) -> Result<$ty, DiskError> {
            const N: usize = std::mem::size_of::<$ty>();
            check_len(buf, N)?;
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(&buf[..N]);
            Ok(<$ty>::from_be_bytes(bytes))
        }

        #[inline]
        pub fn $write_le(buf: &mut [u8], value: $ty) -> Result<(), DiskError> {
            const N: usize = std::mem::size_of::<$ty>();
            check_len(buf, N)?;
            buf[..N].copy_from_slice(&value.to_le_bytes());
            Ok(())
        }

        #[inline]
        pub fn $write_be(buf: &mut [u8], value: $ty) -> Result<(), DiskError> {
            const N: usize = std::mem::size_of::<$ty>();
            check_len(buf, N)?;
            buf[..N].copy_from_slice(&value.to_be_bytes());
            Ok(())
        }
    };
}

int_codec!(read_u16_le, read_u16_be, write_u16_le, write_u16_be, u16);
int_codec!(read_u32_le, read_u32_be, write_u32_le, write_u32_be, u32);
int_codec!(read_u64_le, read_u64_be, write_u64_le, write_u64_be, u64);
int_codec!(read_i16_le, read_i16_be, write_i16_le, write_i16_be, i16);
int_codec!(read_i32_le, read_i32_be, write_i32_le, write_i32_be, i32);
int_codec!(read_i64_le, read_i64_be, write_i64_le, write_i64_be, i64);

/// Read a GUID stored in the Microsoft mixed encoding (first three fields
/// little-endian, final eight bytes raw).
pub fn read_guid_mixed(buf: &[u8]) -> Result<Guid, DiskError> {
    check_len(buf, 16)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[..16]);
    Ok(Guid::from_mixed_le_bytes(bytes))
}

pub fn write_guid_mixed(buf: &mut [u8], guid: Guid) -> Result<(), DiskError> {
    check_len(buf, 16)?;
    buf[..16].copy_from_slice(&guid.to_mixed_le_bytes());
    Ok(())
}

/// Read a GUID stored as sixteen raw bytes in display order.
pub fn read_guid_be(buf: &[u8]) -> Result<Guid, DiskError> {
    check_len(buf, 16)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[..16]);
    Ok(Guid::from_be_bytes(bytes))
}

pub fn write_guid_be(buf: &mut [u8], guid: Guid) -> Result<(), DiskError> {
    check_len(buf, 16)?;
    buf[..16].copy_from_slice(&guid.to_be_bytes());
    Ok(())
}

fn decode_utf16(units: Vec<u16>, strip_nuls: bool) -> Result<String, DiskError> {
    let mut s = char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|e| DiskError::Corrupt(format!("invalid UTF-16 string data: {}", e)))?;
    if strip_nuls {
        let trimmed = s.trim_end_matches('\0').len();
        s.truncate(trimmed);
    }
    Ok(s)
}

/// Read a UTF-16LE string slot occupying the whole of `buf`.
/// Trailing NUL code units are stripped only when `strip_nuls` is set.
pub fn read_utf16_le(buf: &[u8], strip_nuls: bool) -> Result<String, DiskError> {
    if buf.len() % 2 != 0 {
        return Err(DiskError::Corrupt(format!(
            "UTF-16 slot has odd length {}",
            buf.len()
        )));
    }
    let units: Vec<u16> = buf.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    decode_utf16(units, strip_nuls)
}

/// Read a UTF-16BE string slot occupying the whole of `buf`.
pub fn read_utf16_be(buf: &[u8], strip_nuls: bool) -> Result<String, DiskError> {
    if buf.len() % 2 != 0 {
        return Err(DiskError::Corrupt(format!(
            "UTF-16 slot has odd length {}",
            buf.len()
        )));
    }
    let units: Vec<u16> = buf.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
    decode_utf16(units, strip_nuls)
}

/// Write `s` as UTF-16LE into the fixed slot `buf`, zero-padding the
/// remainder. Fails with SliceTooShort if the encoded string overflows the
/// slot.
pub fn write_utf16_le(buf: &mut [u8], s: &str) -> Result<usize, DiskError> {
    let units: Vec<u16> = s.encode_utf16().collect();
    check_len(buf, units.len() * 2)?;
    for (chunk, unit) in buf.chunks_exact_mut(2).zip(units.iter()) {
        chunk.copy_from_slice(&unit.to_le_bytes());
    }
    buf[units.len() * 2..].fill(0);
    Ok(units.len() * 2)
}

/// Write `s` as UTF-16BE into the fixed slot `buf`, zero-padding the remainder.
pub fn write_utf16_be(buf: &mut [u8], s: &str) -> Result<usize, DiskError> {
    let units: Vec<u16> = s.encode_utf16().collect();
    check_len(buf, units.len() * 2)?;
    for (chunk, unit) in buf.chunks_exact_mut(2).zip(units.iter()) {
        chunk.copy_from_slice(&unit.to_be_bytes());
    }
    buf[units.len() * 2..].fill(0);
    Ok(units.len() * 2)
}

/// Read a Latin-1 four-byte tag, as used for platform codes in parent
/// locator records and creator fields.
pub fn read_tag(buf: &[u8]) -> Result<String, DiskError> {
    check_len(buf, 4)?;
    Ok(buf[..4].iter().map(|&b| b as char).collect())
}

/// Write a Latin-1 four-byte tag. Tags shorter than four characters are
/// padded with NULs; longer tags or non-Latin-1 characters are rejected.
pub fn write_tag(buf: &mut [u8], tag: &str) -> Result<(), DiskError> {
    check_len(buf, 4)?;
    if tag.chars().count() > 4 {
        return Err(DiskError::Corrupt(format!("tag longer than four characters: {}", tag)));
    }
    buf[..4].fill(0);
    for (i, c) in tag.chars().enumerate() {
        if c as u32 > 0xFF {
            return Err(DiskError::Corrupt(format!("tag contains non-Latin-1 character: {}", tag)));
        }
        buf[i] = c as u8;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trips() {
        let mut buf = [0u8; 8];

        write_u16_le(&mut buf, 0xBEEF).unwrap();
        assert_eq!(read_u16_le(&buf).unwrap(), 0xBEEF);
        assert_eq!(buf[0], 0xEF);

        write_u16_be(&mut buf, 0xBEEF).unwrap();
        assert_eq!(read_u16_be(&buf).unwrap(), 0xBEEF);
        assert_eq!(buf[0], 0xBE);

        write_u32_le(&mut buf, 0xDEADBEEF).unwrap();
        assert_eq!(read_u32_le(&buf).unwrap(), 0xDEADBEEF);
        write_u32_be(&mut buf, 0xDEADBEEF).unwrap();
        assert_eq!(read_u32_be(&buf).unwrap(), 0xDEADBEEF);

        write_u64_le(&mut buf, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(read_u64_le(&buf).unwrap(), 0x0123_4567_89AB_CDEF);
        write_u64_be(&mut buf, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(read_u64_be(&buf).unwrap(), 0x0123_4567_89AB_CDEF);

        write_i32_le(&mut buf, -12345).unwrap();
        assert_eq!(read_i32_le(&buf).unwrap(), -12345);
        write_i64_be(&mut buf, -1).unwrap();
        assert_eq!(read_i64_be(&buf).unwrap(), -1);
        write_i16_be(&mut buf, -2).unwrap();
        assert_eq!(read_i16_be(&buf).unwrap(), -2);
    }

    #[test]
    fn short_slices_rejected() {
        let mut buf = [0u8; 3];
        assert!(matches!(
            read_u32_le(&buf),
            Err(DiskError::SliceTooShort { needed: 4, actual: 3 })
        ));
        assert!(matches!(
            write_u32_be(&mut buf, 1),
            Err(DiskError::SliceTooShort { needed: 4, actual: 3 })
        ));
        assert!(matches!(read_u64_be(&buf), Err(DiskError::SliceTooShort { .. })));
        assert!(matches!(read_guid_mixed(&buf), Err(DiskError::SliceTooShort { .. })));
    }

    #[test]
    fn guid_round_trips_both_encodings() {
        let guid = Guid::from_fields(0xC12A7328, 0xF81F, 0x11D2, [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B]);
        let mut buf = [0u8; 16];

        write_guid_mixed(&mut buf, guid).unwrap();
        assert_eq!(buf[0], 0x28);
        assert_eq!(read_guid_mixed(&buf).unwrap(), guid);

        write_guid_be(&mut buf, guid).unwrap();
        assert_eq!(buf[0], 0xC1);
        assert_eq!(read_guid_be(&buf).unwrap(), guid);
    }

    #[test]
    fn utf16_slot_round_trip() {
        let mut slot = [0xAAu8; 24];
        let written = write_utf16_le(&mut slot, "base.vhd").unwrap();
        assert_eq!(written, 16);
        // The remainder of the slot must be zero-padded.
        assert!(slot[16..].iter().all(|&b| b == 0));

        assert_eq!(read_utf16_le(&slot, true).unwrap(), "base.vhd");
        let unstripped = read_utf16_le(&slot, false).unwrap();
        assert_eq!(unstripped.len(), 12);
        assert!(unstripped.ends_with('\0'));
    }

    #[test]
    fn utf16_overflow_rejected() {
        let mut slot = [0u8; 8];
        assert!(matches!(
            write_utf16_le(&mut slot, "too long for slot"),
            Err(DiskError::SliceTooShort { .. })
        ));
    }

    #[test]
    fn utf16_be_round_trip() {
        let mut slot = [0u8; 32];
        write_utf16_be(&mut slot, "parent").unwrap();
        assert_eq!(slot[0], 0);
        assert_eq!(slot[1], b'p');
        assert_eq!(read_utf16_be(&slot, true).unwrap(), "parent");
    }

    #[test]
    fn unpaired_surrogate_is_corrupt() {
        // A lone high surrogate (0xD800) cannot decode.
        let slot = [0x00, 0xD8];
        assert!(matches!(read_utf16_le(&slot, false), Err(DiskError::Corrupt(_))));
    }

    #[test]
    fn tag_round_trip() {
        let mut buf = [0u8; 4];
        write_tag(&mut buf, "W2ru").unwrap();
        assert_eq!(&buf, b"W2ru");
        assert_eq!(read_tag(&buf).unwrap(), "W2ru");

        assert!(write_tag(&mut buf, "toolong").is_err());
        assert!(matches!(write_tag(&mut buf[..2], "W2ru"), Err(DiskError::SliceTooShort { .. })));
    }
}
