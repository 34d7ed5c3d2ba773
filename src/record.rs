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

    src/record.rs

    The serialization contract shared by every on-disk record type.
*/

use crate::DiskError;

/// An on-disk record that can be populated from, and optionally written to,
/// a byte slice at a fixed layout.
///
/// `read_from` may partially populate the record and reports the number of
/// bytes it consumed, so callers can iterate across variable-length arrays
/// of heterogeneous records. `write_to` has a default implementation that
/// fails; record types that are only ever parsed simply never override it.
pub trait DiskRecord {
    /// The number of bytes this record occupies on disk. May be a constant
    /// for fixed-layout records or computed from loaded fields.
    fn size_bytes(&self) -> usize;

    /// Populate the record from the head of `buf`, returning the number of
    /// bytes consumed.
    fn read_from(&mut self, buf: &[u8]) -> Result<usize, DiskError>;

    /// Serialize the record to the head of `buf`, returning the number of
    /// bytes written.
    fn write_to(&self, buf: &mut [u8]) -> Result<usize, DiskError> {
        let _ = buf;
        Err(DiskError::NotSupported("writing this record type"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[derive(Default)]
    struct ParseOnly {
        value: u16,
    }

    impl DiskRecord for ParseOnly {
        fn size_bytes(&self) -> usize {
            2
        }

        fn read_from(&mut self, buf: &[u8]) -> Result<usize, DiskError> {
            self.value = codec::read_u16_be(buf)?;
            Ok(2)
        }
    }

    #[test]
    fn default_write_is_unsupported() {
        let mut rec = ParseOnly::default();
        assert_eq!(rec.read_from(&[0x12, 0x34]).unwrap(), 2);
        assert_eq!(rec.value, 0x1234);

        let mut buf = [0u8; 2];
        assert!(matches!(rec.write_to(&mut buf), Err(DiskError::NotSupported(_))));
    }
}
