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

    src/ownership.rs

    Explicit per-edge ownership of wrapped streams.

    A disk chain is a linked list of wrappers over wrappers, and the same
    base image may serve as parent for several differencing children. Each
    wrapping edge therefore carries an explicit Ownership tag: the wrapper
    releases the wrapped resource on teardown iff the edge is tagged
    Dispose. Release is an explicit, idempotent close rather than a
    reference-count side effect, so a shared parent is never closed by a
    child that was told not to own it.
*/

use std::sync::{Arc, Mutex};

use crate::{
    io,
    io::{Read, Seek, SeekFrom, Write},
    sparse::{SparseStream, StreamExtent},
    DiskError,
};

/// Whether a wrapper releases the resource it wraps when it is torn down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ownership {
    /// The wrapped resource remains open; some other handle is responsible
    /// for it.
    None,
    /// The wrapper closes the wrapped resource on teardown.
    Dispose,
}

struct SharedInner {
    stream: Option<Box<dyn SparseStream>>,
}

/// A cloneable handle to a sparse stream that can be aliased by several
/// wrappers and closed exactly once.
///
/// Clones share the underlying stream but keep independent cursors; the
/// positioned accessors (`read_at` and friends) are the preferred interface
/// between layers.
#[derive(Clone)]
pub struct SharedStream {
    inner: Arc<Mutex<SharedInner>>,
    position: u64,
}

fn closed_err() -> io::Error {
    io::Error::other("stream has been closed")
}

impl SharedStream {
    pub fn new(stream: Box<dyn SparseStream>) -> SharedStream {
        SharedStream {
            inner: Arc::new(Mutex::new(SharedInner { stream: Some(stream) })),
            position: 0,
        }
    }

    pub fn from_stream<S: SparseStream + 'static>(stream: S) -> SharedStream {
        SharedStream::new(Box::new(stream))
    }

    /// Release the underlying stream. Idempotent; every other handle to the
    /// same stream observes the closure.
    pub fn close(&self) {
        self.inner.lock().unwrap().stream = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().stream.is_none()
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().unwrap().stream.as_ref().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn can_write(&self) -> bool {
        self.inner.lock().unwrap().stream.as_ref().is_some_and(|s| s.can_write())
    }

    pub fn stored_extents(&self) -> Vec<StreamExtent> {
        self.inner
            .lock()
            .unwrap()
            .stream
            .as_ref()
            .map_or_else(Vec::new, |s| s.stored_extents())
    }

    pub fn extents_in(&self, start: u64, count: u64) -> Vec<StreamExtent> {
        self.inner
            .lock()
            .unwrap()
            .stream
            .as_ref()
            .map_or_else(Vec::new, |s| s.extents_in(start, count))
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        let stream = guard.stream.as_mut().ok_or_else(closed_err)?;
        stream.seek(SeekFrom::Start(pos))?;
        stream.read(buf)
    }

    pub fn read_exact_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let stream = guard.stream.as_mut().ok_or_else(closed_err)?;
        stream.read_exact_at(pos, buf)
    }

    pub fn write_at(&self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        let stream = guard.stream.as_mut().ok_or_else(closed_err)?;
        stream.seek(SeekFrom::Start(pos))?;
        stream.write(buf)
    }

    pub fn write_all_at(&self, pos: u64, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let stream = guard.stream.as_mut().ok_or_else(closed_err)?;
        stream.write_all_at(pos, buf)
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let stream = guard.stream.as_mut().ok_or_else(closed_err)?;
        Write::flush(stream)
    }

    pub fn set_stream_len(&self, len: u64) -> Result<(), DiskError> {
        let mut guard = self.inner.lock().unwrap();
        let stream = guard.stream.as_mut().ok_or_else(closed_err)?;
        stream.set_stream_len(len)
    }
}

impl Read for SharedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for SharedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        SharedStream::flush(self)
    }
}

impl Seek for SharedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.len() as i64 + offset,
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

impl SparseStream for SharedStream {
    fn len(&self) -> u64 {
        SharedStream::len(self)
    }

    fn can_write(&self) -> bool {
        SharedStream::can_write(self)
    }

    fn set_stream_len(&mut self, len: u64) -> Result<(), DiskError> {
        SharedStream::set_stream_len(self, len)
    }

    fn stored_extents(&self) -> Vec<StreamExtent> {
        SharedStream::stored_extents(self)
    }

    fn extents_in(&self, start: u64, count: u64) -> Vec<StreamExtent> {
        SharedStream::extents_in(self, start, count)
    }
}

/// One ownership-tagged edge to a shared stream. Dropping (or explicitly
/// releasing) a Dispose-tagged edge closes the stream; a None-tagged edge
/// leaves it open for whoever else holds a handle.
pub struct StreamRef {
    stream: SharedStream,
    ownership: Ownership,
}

impl StreamRef {
    pub fn new(stream: SharedStream, ownership: Ownership) -> StreamRef {
        StreamRef { stream, ownership }
    }

    /// Wrap a stream this edge owns outright.
    pub fn owned(stream: Box<dyn SparseStream>) -> StreamRef {
        StreamRef::new(SharedStream::new(stream), Ownership::Dispose)
    }

    /// Borrow a stream some other handle owns.
    pub fn borrowed(stream: &SharedStream) -> StreamRef {
        StreamRef::new(stream.clone(), Ownership::None)
    }

    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut SharedStream {
        &mut self.stream
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Apply the ownership tag: close the stream iff this edge owns it.
    pub fn release(&mut self) {
        if self.ownership == Ownership::Dispose {
            self.stream.close();
        }
    }

    /// Dissolve the edge, transferring responsibility for the stream to
    /// the returned handle's holder.
    pub fn into_stream(mut self) -> SharedStream {
        self.ownership = Ownership::None;
        self.stream.clone()
    }
}

impl Drop for StreamRef {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::memory::SparseMemoryStream;

    #[test]
    fn dispose_edge_closes_shared_handle() {
        let shared = SharedStream::from_stream(SparseMemoryStream::new(4096));
        let observer = shared.clone();

        let edge = StreamRef::new(shared, Ownership::Dispose);
        assert!(!observer.is_closed());
        drop(edge);
        assert!(observer.is_closed());

        let mut buf = [0u8; 4];
        assert!(observer.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn borrowed_edge_leaves_stream_open() {
        let shared = SharedStream::from_stream(SparseMemoryStream::new(4096));
        let edge = StreamRef::borrowed(&shared);
        drop(edge);
        assert!(!shared.is_closed());

        let mut buf = [0u8; 4];
        shared.read_exact_at(0, &mut buf).unwrap();
    }

    #[test]
    fn close_is_idempotent_across_edges() {
        let shared = SharedStream::from_stream(SparseMemoryStream::new(64));
        let edge_a = StreamRef::new(shared.clone(), Ownership::Dispose);
        let edge_b = StreamRef::new(shared.clone(), Ownership::Dispose);
        drop(edge_a);
        drop(edge_b);
        assert!(shared.is_closed());
    }

    #[test]
    fn clones_keep_independent_cursors() {
        let shared = SharedStream::from_stream(SparseMemoryStream::new(64));
        shared.write_all_at(0, &[1, 2, 3, 4]).unwrap();

        let mut a = shared.clone();
        let mut b = shared.clone();
        let mut buf = [0u8; 2];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        b.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        a.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
    }
}
