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

    src/sparse/memory.rs

    A sparse byte stream held in memory, allocated in 4 KiB granules.
    Granules come into existence on first write; unwritten regions read as
    zeros and are reported as holes.
*/

use std::collections::BTreeMap;

use crate::{
    io,
    io::{Read, Seek, SeekFrom, Write},
    sparse::{SparseStream, StreamExtent},
    DiskError,
};

const GRANULE: u64 = 4096;

pub struct SparseMemoryStream {
    granules: BTreeMap<u64, Box<[u8]>>,
    length: u64,
    position: u64,
}

impl SparseMemoryStream {
    pub fn new(length: u64) -> SparseMemoryStream {
        SparseMemoryStream {
            granules: BTreeMap::new(),
            length,
            position: 0,
        }
    }

    /// Convenience constructor: a stream of `length` bytes with `data`
    /// stored at `offset`.
    pub fn with_data(length: u64, offset: u64, data: &[u8]) -> SparseMemoryStream {
        let mut stream = SparseMemoryStream::new(length);
        let mut clipped = data;
        if offset + clipped.len() as u64 > length {
            clipped = &clipped[..(length.saturating_sub(offset)) as usize];
        }
        stream.store(offset, clipped);
        stream
    }

    fn store(&mut self, offset: u64, data: &[u8]) {
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let granule_idx = pos / GRANULE;
            let granule_off = (pos % GRANULE) as usize;
            let chunk = data.len().min(done + (GRANULE as usize - granule_off)) - done;

            let granule = self
                .granules
                .entry(granule_idx)
                .or_insert_with(|| vec![0u8; GRANULE as usize].into_boxed_slice());
            granule[granule_off..granule_off + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
    }

    fn fetch(&self, offset: u64, buf: &mut [u8]) {
        buf.fill(0);
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let granule_idx = pos / GRANULE;
            let granule_off = (pos % GRANULE) as usize;
            let chunk = buf.len().min(done + (GRANULE as usize - granule_off)) - done;

            if let Some(granule) = self.granules.get(&granule_idx) {
                buf[done..done + chunk].copy_from_slice(&granule[granule_off..granule_off + chunk]);
            }
            done += chunk;
        }
    }
}

impl Read for SparseMemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.length.saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        self.fetch(self.position, &mut buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for SparseMemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.store(self.position, buf);
        self.position += buf.len() as u64;
        self.length = self.length.max(self.position);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SparseMemoryStream {
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

impl SparseStream for SparseMemoryStream {
    fn len(&self) -> u64 {
        self.length
    }

    fn can_write(&self) -> bool {
        true
    }

    fn set_stream_len(&mut self, len: u64) -> Result<(), DiskError> {
        if len < self.length {
            let first_dead = len.div_ceil(GRANULE);
            self.granules.retain(|&idx, _| idx < first_dead);
            // Zero the tail of the boundary granule so a later re-extension
            // reads zeros, not the truncated bytes.
            if len % GRANULE != 0 {
                if let Some(granule) = self.granules.get_mut(&(len / GRANULE)) {
                    granule[(len % GRANULE) as usize..].fill(0);
                }
            }
        }
        self.length = len;
        self.position = self.position.min(len);
        Ok(())
    }

    fn stored_extents(&self) -> Vec<StreamExtent> {
        let mut out: Vec<StreamExtent> = Vec::new();
        for &idx in self.granules.keys() {
            let start = idx * GRANULE;
            if start >= self.length {
                break;
            }
            let length = GRANULE.min(self.length - start);
            match out.last_mut() {
                Some(last) if last.end() == start => last.length += length,
                _ => out.push(StreamExtent::new(start, length)),
            }
        }
        out
    }
}
