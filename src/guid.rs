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

    src/guid.rs

    A 128-bit globally unique identifier, as used by disk image files to
    fingerprint themselves and their parents, and by GPT to identify
    partition types.

    Two on-disk encodings exist. Microsoft-origin formats store the first
    three fields little-endian and the final eight bytes raw ("mixed"
    encoding); everything else stores all sixteen bytes in display order
    ("big-endian" encoding). The Guid type itself always holds the bytes in
    display order.
*/

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::DiskError;

#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Guid([u8; 16]);

impl Guid {
    /// The all-zero GUID, used as the "no parent" sentinel in image chains.
    pub const NIL: Guid = Guid([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Guid {
        Guid(bytes)
    }

    /// Construct a GUID from its four display fields.
    pub const fn from_fields(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Guid {
        let b1 = d1.to_be_bytes();
        let b2 = d2.to_be_bytes();
        let b3 = d3.to_be_bytes();
        Guid([
            b1[0], b1[1], b1[2], b1[3], b2[0], b2[1], b3[0], b3[1], d4[0], d4[1], d4[2], d4[3], d4[4], d4[5], d4[6],
            d4[7],
        ])
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Return the sixteen bytes in display ("big-endian") order.
    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn from_be_bytes(bytes: [u8; 16]) -> Guid {
        Guid(bytes)
    }

    /// Return the bytes in the Microsoft mixed encoding: the first three
    /// fields byte-swapped to little-endian, the final eight bytes raw.
    pub fn to_mixed_le_bytes(self) -> [u8; 16] {
        let b = self.0;
        [
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        ]
    }

    pub fn from_mixed_le_bytes(bytes: [u8; 16]) -> Guid {
        let b = bytes;
        Guid([
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        ])
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl FromStr for Guid {
    type Err = DiskError;

    /// Parse the canonical 8-4-4-4-12 hex form, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 || s.split('-').count() != 5 {
            return Err(DiskError::Corrupt(format!("malformed GUID string: {}", s)));
        }

        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| DiskError::Corrupt(format!("malformed GUID string: {}", s)))?;
        }
        Ok(Guid(bytes))
    }
}
