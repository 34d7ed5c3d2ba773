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

    src/vhd/stream.rs

    The sparse content stream of dynamic and differencing VHD images.

    Virtual space is divided into blocks mapped by the block allocation
    table (BAT). Each allocated block is preceded in the file by a sector
    bitmap, one bit per 512-byte sector, MSB first: a set bit means the
    sector is present in this image; a clear bit reads as zero here and
    falls through to the parent when the image is stacked.

    Writes allocate blocks on demand by displacing the trailing footer, and
    mark the touched sectors present.
*/

use bit_vec::BitVec;

use crate::{
    io,
    io::{Read, Seek, SeekFrom, Write},
    ownership::SharedStream,
    sparse::{SparseStream, StreamExtent},
    vhd::{DynamicHeader, FOOTER_SIZE},
    DiskError,
    SECTOR_SIZE,
};

/// The BAT entry marking an unallocated block.
pub const BAT_UNUSED: u32 = 0xFFFF_FFFF;

const SECTOR: u64 = SECTOR_SIZE as u64;

pub struct DynamicStream {
    stream: SharedStream,
    bat: Vec<u32>,
    bat_offset: u64,
    block_size: u64,
    /// Size of each block's sector bitmap, padded to a sector boundary.
    bitmap_bytes: u64,
    length: u64,
    position: u64,
    writable: bool,
}

impl DynamicStream {
    /// Open the content of a sparse image whose dynamic header has been
    /// parsed. Reads the whole BAT up front.
    pub fn open(
        stream: SharedStream,
        header: &DynamicHeader,
        capacity: u64,
        writable: bool,
    ) -> Result<DynamicStream, DiskError> {
        let block_size = header.block_size as u64;
        if block_size == 0 || block_size % SECTOR != 0 {
            return Err(DiskError::Corrupt(format!("invalid VHD block size {:#x}", block_size)));
        }

        let blocks_needed = capacity.div_ceil(block_size);
        if (header.max_table_entries as u64) < blocks_needed {
            return Err(DiskError::Corrupt(format!(
                "BAT holds {} entries but the capacity requires {}",
                header.max_table_entries, blocks_needed
            )));
        }

        let mut raw = vec![0u8; header.max_table_entries as usize * 4];
        stream.read_exact_at(header.table_offset, &mut raw)?;
        let bat = raw
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let sectors_per_block = block_size / SECTOR;
        let bitmap_bytes = sectors_per_block.div_ceil(8).div_ceil(SECTOR) * SECTOR;

        Ok(DynamicStream {
            stream,
            bat,
            bat_offset: header.table_offset,
            block_size,
            bitmap_bytes,
            length: capacity,
            position: 0,
            writable,
        })
    }

    fn sectors_per_block(&self) -> u64 {
        self.block_size / SECTOR
    }

    /// File offset of an allocated block's data area.
    fn data_base(&self, block: usize) -> u64 {
        self.bat[block] as u64 * SECTOR + self.bitmap_bytes
    }

    fn read_bitmap(&self, block: usize) -> io::Result<BitVec> {
        let mut raw = vec![0u8; self.bitmap_bytes as usize];
        self.stream.read_exact_at(self.bat[block] as u64 * SECTOR, &mut raw)?;
        Ok(BitVec::from_bytes(&raw))
    }

    /// Allocate a block at the end of the file, displacing the trailing
    /// footer. The new bitmap and data are zeroed; the BAT is updated in
    /// file and in memory.
    fn allocate_block(&mut self, block: usize) -> io::Result<()> {
        let file_len = self.stream.len();
        if file_len < FOOTER_SIZE as u64 {
            return Err(io::Error::other("image file lost its trailing footer"));
        }
        let block_pos = file_len - FOOTER_SIZE as u64;

        let mut footer = [0u8; FOOTER_SIZE];
        self.stream.read_exact_at(block_pos, &mut footer)?;

        let zeros = vec![0u8; (self.bitmap_bytes + self.block_size) as usize];
        self.stream.write_all_at(block_pos, &zeros)?;
        self.stream.write_all_at(block_pos + zeros.len() as u64, &footer)?;

        let sector = (block_pos / SECTOR) as u32;
        self.bat[block] = sector;
        self.stream
            .write_all_at(self.bat_offset + block as u64 * 4, &sector.to_be_bytes())?;

        log::trace!("allocated VHD block {} at sector {:#x}", block, sector);
        Ok(())
    }

    /// Mark sectors `[first, last]` of a block present.
    fn set_bitmap_bits(&mut self, block: usize, first: u64, last: u64) -> io::Result<()> {
        let bitmap_pos = self.bat[block] as u64 * SECTOR;
        let lo_byte = (first / 8) as usize;
        let hi_byte = (last / 8) as usize;

        let mut raw = vec![0u8; hi_byte - lo_byte + 1];
        self.stream.read_exact_at(bitmap_pos + lo_byte as u64, &mut raw)?;
        for s in first..=last {
            raw[(s / 8) as usize - lo_byte] |= 0x80 >> (s % 8);
        }
        self.stream.write_all_at(bitmap_pos + lo_byte as u64, &raw)
    }
}

impl Read for DynamicStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.length.saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        buf[..n].fill(0);

        let mut done = 0usize;
        while done < n {
            let pos = self.position + done as u64;
            let block = (pos / self.block_size) as usize;
            let block_off = pos % self.block_size;
            let chunk = ((self.block_size - block_off) as u64).min((n - done) as u64);

            if self.bat[block] != BAT_UNUSED {
                let bitmap = self.read_bitmap(block)?;
                let data_base = self.data_base(block);
                let end_off = block_off + chunk;

                // Coalesce runs of present sectors into single device reads.
                let mut off = block_off;
                while off < end_off {
                    let sector = off / SECTOR;
                    let sector_end = ((sector + 1) * SECTOR).min(end_off);
                    if bitmap.get(sector as usize).unwrap_or(false) {
                        let mut run_end = sector_end;
                        let mut next = sector + 1;
                        while run_end < end_off && bitmap.get(next as usize).unwrap_or(false) {
                            run_end = ((next + 1) * SECTOR).min(end_off);
                            next += 1;
                        }
                        let lo = done + (off - block_off) as usize;
                        let hi = done + (run_end - block_off) as usize;
                        self.stream.read_exact_at(data_base + off, &mut buf[lo..hi])?;
                        off = run_end;
                    }
                    else {
                        off = sector_end;
                    }
                }
            }
            done += chunk as usize;
        }

        self.position += n as u64;
        Ok(n)
    }
}

impl Write for DynamicStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "image is read-only"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self.position + buf.len() as u64;
        if end > self.length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past the end of a fixed-capacity image",
            ));
        }

        let mut done = 0usize;
        while done < buf.len() {
            let pos = self.position + done as u64;
            let block = (pos / self.block_size) as usize;
            let block_off = pos % self.block_size;
            let chunk = ((self.block_size - block_off) as u64).min((buf.len() - done) as u64) as usize;

            if self.bat[block] == BAT_UNUSED {
                self.allocate_block(block)?;
            }

            let data_base = self.data_base(block);
            self.stream.write_all_at(data_base + block_off, &buf[done..done + chunk])?;

            let first = block_off / SECTOR;
            let last = (block_off + chunk as u64 - 1) / SECTOR;
            self.set_bitmap_bits(block, first, last)?;

            done += chunk;
        }

        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Seek for DynamicStream {
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

impl SparseStream for DynamicStream {
    fn len(&self) -> u64 {
        self.length
    }

    fn can_write(&self) -> bool {
        self.writable
    }

    fn stored_extents(&self) -> Vec<StreamExtent> {
        let mut out: Vec<StreamExtent> = Vec::new();
        let mut push = |out: &mut Vec<StreamExtent>, start: u64, length: u64| match out.last_mut() {
            Some(last) if last.end() == start => last.length += length,
            _ => out.push(StreamExtent::new(start, length)),
        };

        for (block, &entry) in self.bat.iter().enumerate() {
            let block_start = block as u64 * self.block_size;
            if block_start >= self.length {
                break;
            }
            if entry == BAT_UNUSED {
                continue;
            }

            match self.read_bitmap(block) {
                Ok(bitmap) => {
                    for s in 0..self.sectors_per_block() {
                        if !bitmap.get(s as usize).unwrap_or(false) {
                            continue;
                        }
                        let start = block_start + s * SECTOR;
                        if start >= self.length {
                            break;
                        }
                        push(&mut out, start, SECTOR.min(self.length - start));
                    }
                }
                Err(e) => {
                    // An unreadable bitmap degrades to block granularity.
                    log::warn!("failed to read sector bitmap for block {}: {}", block, e);
                    push(&mut out, block_start, self.block_size.min(self.length - block_start));
                }
            }
        }
        out
    }
}
