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

    src/sparse/mod.rs

    The sparse stream abstraction: a random-access byte stream that knows
    which of its ranges are materially stored. Sparse streams are the
    currency passed between image layers, the chain resolver, and format
    modules.
*/

use std::fmt::{Display, Formatter};

use crate::{
    io,
    io::{Read, ReadWriteSeek, Seek, SeekFrom, Write},
    DiskError,
};

pub mod layered;
pub mod memory;
pub mod tracing;

/// A half-open stored range `[start, start + length)` within a sparse stream.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct StreamExtent {
    pub start: u64,
    pub length: u64,
}

impl StreamExtent {
    pub fn new(start: u64, length: u64) -> StreamExtent {
        StreamExtent { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// The overlap of two extents, if any.
    pub fn intersection(&self, other: &StreamExtent) -> Option<StreamExtent> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (start < end).then(|| StreamExtent::new(start, end - start))
    }
}

impl From<(u64, u64)> for StreamExtent {
    fn from((start, length): (u64, u64)) -> Self {
        StreamExtent::new(start, length)
    }
}

impl Display for StreamExtent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.start, self.end())
    }
}

/// Merge two sorted, non-overlapping extent lists into one, coalescing
/// adjacent and overlapping ranges.
pub fn union_extents(a: &[StreamExtent], b: &[StreamExtent]) -> Vec<StreamExtent> {
    let mut merged: Vec<StreamExtent> = a.iter().chain(b.iter()).filter(|e| !e.is_empty()).copied().collect();
    merged.sort();

    let mut out: Vec<StreamExtent> = Vec::with_capacity(merged.len());
    for ext in merged {
        match out.last_mut() {
            Some(last) if ext.start <= last.end() => {
                last.length = last.length.max(ext.end() - last.start);
            }
            _ => out.push(ext),
        }
    }
    out
}

/// Clip a sorted extent list to a query window.
pub fn clip_extents(list: &[StreamExtent], window: StreamExtent) -> Vec<StreamExtent> {
    list.iter().filter_map(|e| e.intersection(&window)).collect()
}

/// Remove every range in `remove` from the sorted list `list`.
pub fn subtract_extents(list: &[StreamExtent], remove: &[StreamExtent]) -> Vec<StreamExtent> {
    let mut out = Vec::new();
    for ext in list {
        let mut cursor = ext.start;
        let end = ext.end();
        for r in remove {
            if r.end() <= cursor || r.start >= end {
                continue;
            }
            if r.start > cursor {
                out.push(StreamExtent::new(cursor, r.start - cursor));
            }
            cursor = cursor.max(r.end());
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            out.push(StreamExtent::new(cursor, end - cursor));
        }
    }
    out
}

/// A random-access byte stream augmented with knowledge of which ranges are
/// actually stored.
///
/// Positioning follows the usual `Seek` contract; reads past the end of the
/// stream return short counts, and reads of unstored ranges are resolved by
/// the concrete layer (zeros at the bottom of a stack, fall-through in the
/// middle of one).
pub trait SparseStream: Read + Write + Seek + Send {
    /// The logical length of the stream in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn can_write(&self) -> bool;

    /// Change the logical length of the stream.
    fn set_stream_len(&mut self, len: u64) -> Result<(), DiskError> {
        let _ = len;
        Err(DiskError::NotSupported("resizing this stream"))
    }

    /// Every materially stored range, sorted and non-overlapping, within
    /// `[0, len())`.
    fn stored_extents(&self) -> Vec<StreamExtent>;

    /// Stored ranges clipped to the query window.
    fn extents_in(&self, start: u64, count: u64) -> Vec<StreamExtent> {
        clip_extents(&self.stored_extents(), StreamExtent::new(start, count))
    }

    /// Read exactly `buf.len()` bytes at `pos`, leaving the cursor after the
    /// read.
    fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(pos))?;
        self.read_exact(buf)
    }

    /// Write all of `buf` at `pos`, leaving the cursor after the write.
    fn write_all_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(pos))?;
        self.write_all(buf)
    }
}

/// Adapt an arbitrary host byte stream into a sparse stream whose entire
/// length is considered stored.
///
/// This is how OS file streams enter the layering machinery: a fixed image
/// file has no sparseness of its own, so every byte is "stored".
pub struct FullStream<S> {
    inner: S,
    length: u64,
    writable: bool,
}

impl<S: ReadWriteSeek + Send> FullStream<S> {
    pub fn new(mut inner: S, writable: bool) -> io::Result<FullStream<S>> {
        let length = io::stream_length(&mut inner)?;
        Ok(FullStream { inner, length, writable })
    }
}

impl<S: ReadWriteSeek + Send> Read for FullStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: ReadWriteSeek + Send> Write for FullStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "stream is read-only"));
        }
        let n = self.inner.write(buf)?;
        let pos = self.inner.stream_position()?;
        self.length = self.length.max(pos);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: ReadWriteSeek + Send> Seek for FullStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<S: ReadWriteSeek + Send> SparseStream for FullStream<S> {
    fn len(&self) -> u64 {
        self.length
    }

    fn can_write(&self) -> bool {
        self.writable
    }

    fn stored_extents(&self) -> Vec<StreamExtent> {
        if self.length == 0 {
            Vec::new()
        }
        else {
            vec![StreamExtent::new(0, self.length)]
        }
    }
}

/// A fixed-length window onto a region of another sparse stream.
///
/// Used to expose the data area of a fixed image file (which carries its
/// footer after the data) as a content stream of exactly the advertised
/// capacity. Writes are permitted when the underlying stream allows them,
/// and never reach outside the window.
pub struct SubStream {
    inner: crate::ownership::StreamRef,
    offset: u64,
    length: u64,
    position: u64,
}

impl SubStream {
    pub fn new(inner: crate::ownership::StreamRef, offset: u64, length: u64) -> Result<SubStream, DiskError> {
        if offset + length > inner.stream().len() {
            return Err(DiskError::Corrupt(format!(
                "sub-stream window [{:#x}..{:#x}) exceeds parent length {:#x}",
                offset,
                offset + length,
                inner.stream().len()
            )));
        }
        Ok(SubStream {
            inner,
            offset,
            length,
            position: 0,
        })
    }
}

impl Read for SubStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.length.saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        let n = self.inner.stream().read_at(self.offset + self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for SubStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.inner.stream().can_write() {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "sub-stream is read-only"));
        }
        if self.position + buf.len() as u64 > self.length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past the end of a fixed-length window",
            ));
        }
        let n = self.inner.stream().write_at(self.offset + self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.stream().flush()
    }
}

impl Seek for SubStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.length as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl SparseStream for SubStream {
    fn len(&self) -> u64 {
        self.length
    }

    fn can_write(&self) -> bool {
        self.inner.stream().can_write()
    }

    fn stored_extents(&self) -> Vec<StreamExtent> {
        // Stored ranges of the parent, shifted into the window's coordinates.
        self.inner
            .stream()
            .extents_in(self.offset, self.length)
            .iter()
            .map(|e| StreamExtent::new(e.start - self.offset, e.length))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(start: u64, length: u64) -> StreamExtent {
        StreamExtent::new(start, length)
    }

    #[test]
    fn union_coalesces_adjacent_and_overlapping() {
        let a = [ext(0, 10), ext(20, 10)];
        let b = [ext(10, 10), ext(25, 10), ext(100, 5)];
        assert_eq!(union_extents(&a, &b), vec![ext(0, 35), ext(100, 5)]);
    }

    #[test]
    fn union_ignores_empty_extents() {
        assert_eq!(union_extents(&[ext(5, 0)], &[ext(0, 4)]), vec![ext(0, 4)]);
    }

    #[test]
    fn clip_trims_to_window() {
        let list = [ext(0, 100), ext(200, 50)];
        assert_eq!(clip_extents(&list, ext(50, 175)), vec![ext(50, 50), ext(200, 25)]);
        assert_eq!(clip_extents(&list, ext(100, 100)), vec![]);
    }

    #[test]
    fn subtract_splits_ranges() {
        let list = [ext(0, 100)];
        let holes = [ext(10, 10), ext(50, 25)];
        assert_eq!(
            subtract_extents(&list, &holes),
            vec![ext(0, 10), ext(20, 30), ext(75, 25)]
        );

        // Removing everything leaves nothing.
        assert_eq!(subtract_extents(&list, &[ext(0, 100)]), vec![]);
        // Removing nothing leaves the input.
        assert_eq!(subtract_extents(&list, &[]), vec![ext(0, 100)]);
    }

    #[test]
    fn full_stream_is_entirely_stored() {
        let cursor = io::Cursor::new(vec![0u8; 1024]);
        let stream = FullStream::new(cursor, true).unwrap();
        assert_eq!(stream.len(), 1024);
        assert_eq!(stream.stored_extents(), vec![ext(0, 1024)]);
        assert_eq!(stream.extents_in(512, 1024), vec![ext(512, 512)]);
    }

    #[test]
    fn full_stream_read_only_rejects_writes() {
        let cursor = io::Cursor::new(vec![0u8; 16]);
        let mut stream = FullStream::new(cursor, false).unwrap();
        let err = stream.write(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
