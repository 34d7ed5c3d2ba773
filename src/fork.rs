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

    src/fork.rs

    Run-length extent mapping for non-resident file data: translation of a
    logical byte offset within a file fork to a (device offset, contiguous
    length) pair, with spill-over into a secondary ordered index once the
    fork's in-band extent array is exhausted.
*/

use std::collections::BTreeMap;

use crate::{
    codec,
    io,
    io::{Read, Seek, SeekFrom, Write},
    ownership::SharedStream,
    record::DiskRecord,
    sparse::{SparseStream, StreamExtent},
    CancelToken,
    DiskError,
};

/// Number of extent descriptors a fork carries in-band before spilling.
pub const INLINE_EXTENT_COUNT: usize = 8;

/// On-disk size of one packed extent descriptor.
pub const EXTENT_DESCRIPTOR_SIZE: usize = 8;

/// A contiguous run of allocation blocks: (start_block, block_count).
///
/// A descriptor with `block_count == 0` is a sparse/hole sentinel in some
/// filesystem variants; the core skips it without interpretation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    pub fn new(start_block: u32, block_count: u32) -> ExtentDescriptor {
        ExtentDescriptor { start_block, block_count }
    }
}

impl DiskRecord for ExtentDescriptor {
    fn size_bytes(&self) -> usize {
        EXTENT_DESCRIPTOR_SIZE
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize, DiskError> {
        self.start_block = codec::read_u32_be(buf)?;
        self.block_count = codec::read_u32_be(&buf[4..])?;
        Ok(EXTENT_DESCRIPTOR_SIZE)
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<usize, DiskError> {
        codec::write_u32_be(buf, self.start_block)?;
        codec::write_u32_be(&mut buf[4..], self.block_count)?;
        Ok(EXTENT_DESCRIPTOR_SIZE)
    }
}

/// The on-disk map of one file fork: its logical size, the total number of
/// allocation blocks backing it, and the first eight extents. Further
/// extents live in the volume's extent overflow index, keyed by the owning
/// file's id and the starting block of each continuation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForkMap {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; INLINE_EXTENT_COUNT],
}

/// On-disk size of a fork map record.
pub const FORK_MAP_SIZE: usize = 16 + INLINE_EXTENT_COUNT * EXTENT_DESCRIPTOR_SIZE;

impl DiskRecord for ForkMap {
    fn size_bytes(&self) -> usize {
        FORK_MAP_SIZE
    }

    fn read_from(&mut self, buf: &[u8]) -> Result<usize, DiskError> {
        codec::check_len(buf, FORK_MAP_SIZE)?;
        self.logical_size = codec::read_u64_be(buf)?;
        self.clump_size = codec::read_u32_be(&buf[8..])?;
        self.total_blocks = codec::read_u32_be(&buf[12..])?;
        for (i, extent) in self.extents.iter_mut().enumerate() {
            extent.read_from(&buf[16 + i * EXTENT_DESCRIPTOR_SIZE..])?;
        }
        Ok(FORK_MAP_SIZE)
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<usize, DiskError> {
        codec::check_len(buf, FORK_MAP_SIZE)?;
        codec::write_u64_be(buf, self.logical_size)?;
        codec::write_u32_be(&mut buf[8..], self.clump_size)?;
        codec::write_u32_be(&mut buf[12..], self.total_blocks)?;
        for (i, extent) in self.extents.iter().enumerate() {
            extent.write_to(&mut buf[16 + i * EXTENT_DESCRIPTOR_SIZE..])?;
        }
        Ok(FORK_MAP_SIZE)
    }
}

/// The secondary ordered index consulted when a fork's in-band extents are
/// exhausted. A lookup for `(file_id, start_block)` returns the packed
/// big-endian descriptor array continuing the fork's map at that block, or
/// None when the index holds no such record.
pub trait ExtentOverflow {
    fn lookup(&mut self, file_id: u32, start_block: u64) -> Result<Option<Vec<u8>>, DiskError>;
}

/// An in-memory extent overflow index.
#[derive(Debug, Default)]
pub struct MemoryExtentIndex {
    records: BTreeMap<(u32, u64), Vec<u8>>,
}

impl MemoryExtentIndex {
    pub fn new() -> MemoryExtentIndex {
        MemoryExtentIndex::default()
    }

    /// Insert a continuation record for `(file_id, start_block)`.
    pub fn insert(&mut self, file_id: u32, start_block: u64, extents: &[ExtentDescriptor]) {
        let mut packed = vec![0u8; extents.len() * EXTENT_DESCRIPTOR_SIZE];
        for (i, extent) in extents.iter().enumerate() {
            // Packing into a correctly-sized buffer cannot fail.
            let _ = extent.write_to(&mut packed[i * EXTENT_DESCRIPTOR_SIZE..]);
        }
        self.records.insert((file_id, start_block), packed);
    }
}

impl ExtentOverflow for MemoryExtentIndex {
    fn lookup(&mut self, file_id: u32, start_block: u64) -> Result<Option<Vec<u8>>, DiskError> {
        Ok(self.records.get(&(file_id, start_block)).cloned())
    }
}

/// Compute how far a read may proceed inside one extent.
///
/// `find_extent` guarantees the extent contains `logical_pos`, which makes
/// a zero-length span impossible for a consistent map; a zero span
/// therefore reports the map as corrupt rather than silently ending the
/// read short.
fn extent_span(
    extent: &ExtentDescriptor,
    extent_logical_start: u64,
    logical_pos: u64,
    remaining: usize,
    block_size: u64,
) -> Result<(u64, usize), DiskError> {
    let extent_size = extent.block_count as u64 * block_size;
    let extent_offset = logical_pos - extent_logical_start;
    let span = (remaining as u64).min(extent_size.saturating_sub(extent_offset)) as usize;
    if span == 0 {
        return Err(DiskError::Corrupt(format!(
            "extent map made no forward progress at logical offset {:#x}",
            logical_pos
        )));
    }
    Ok((extent_offset, span))
}

/// A read-only sparse stream over one fork of a file, translating logical
/// offsets through the fork's extent map so that each contiguous extent is
/// read with a single device access.
pub struct ForkStream {
    device: SharedStream,
    overflow: Box<dyn ExtentOverflow + Send>,
    map: ForkMap,
    file_id: u32,
    block_size: u64,
    device_base: u64,
    position: u64,
    cancel: CancelToken,
}

impl ForkStream {
    pub fn new(
        device: SharedStream,
        overflow: Box<dyn ExtentOverflow + Send>,
        map: ForkMap,
        file_id: u32,
        block_size: u32,
        device_base: u64,
    ) -> Result<ForkStream, DiskError> {
        if block_size == 0 {
            return Err(DiskError::Corrupt("fork block size is zero".to_string()));
        }
        Ok(ForkStream {
            device,
            overflow,
            map,
            file_id,
            block_size: block_size as u64,
            device_base,
            position: 0,
            cancel: CancelToken::new(),
        })
    }

    /// Attach a cancellation token, checked between extent iterations and
    /// before each overflow-index probe.
    pub fn with_cancel(mut self, cancel: CancelToken) -> ForkStream {
        self.cancel = cancel;
        self
    }

    pub fn map(&self) -> &ForkMap {
        &self.map
    }

    /// Locate the extent containing `logical_pos`, returning it together
    /// with the logical byte offset at which the extent begins.
    ///
    /// Walks the in-band extents first, then follows the overflow index
    /// until the map's total block count is accounted for. A missing
    /// overflow record while blocks remain is `MissingExtent`; walking off
    /// the end of the map is `BeyondEof`.
    pub fn find_extent(&mut self, logical_pos: u64) -> Result<(ExtentDescriptor, u64), DiskError> {
        let block = logical_pos / self.block_size;
        let mut blocks_seen: u64 = 0;

        for extent in &self.map.extents {
            if extent.block_count == 0 {
                continue;
            }
            if blocks_seen + extent.block_count as u64 > block {
                return Ok((*extent, blocks_seen * self.block_size));
            }
            blocks_seen += extent.block_count as u64;
        }

        let total = self.map.total_blocks as u64;
        while blocks_seen < total {
            self.cancel.check()?;
            let batch = self
                .overflow
                .lookup(self.file_id, blocks_seen)?
                .ok_or(DiskError::MissingExtent {
                    file_id: self.file_id,
                    blocks_seen,
                })?;
            if batch.is_empty() || batch.len() % EXTENT_DESCRIPTOR_SIZE != 0 {
                return Err(DiskError::Corrupt(format!(
                    "malformed extent overflow record for file {} at block {}",
                    self.file_id, blocks_seen
                )));
            }

            let before = blocks_seen;
            for chunk in batch.chunks_exact(EXTENT_DESCRIPTOR_SIZE) {
                let mut extent = ExtentDescriptor::default();
                extent.read_from(chunk)?;
                if extent.block_count == 0 {
                    continue;
                }
                if blocks_seen + extent.block_count as u64 > block {
                    return Ok((extent, blocks_seen * self.block_size));
                }
                blocks_seen += extent.block_count as u64;
            }
            if blocks_seen == before {
                return Err(DiskError::Corrupt(format!(
                    "extent overflow record for file {} at block {} maps no blocks",
                    self.file_id, blocks_seen
                )));
            }
        }

        Err(DiskError::BeyondEof)
    }

    /// Read up to `buf.len()` bytes at `pos`, crossing extents as needed
    /// and issuing one device read per extent crossed. Short only at end
    /// of fork. Advances the stream position past the bytes read.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize, DiskError> {
        let to_do = (buf.len() as u64).min(self.map.logical_size.saturating_sub(pos)) as usize;
        let mut done = 0usize;

        while done < to_do {
            self.cancel.check()?;
            let logical_pos = pos + done as u64;
            let (extent, logical_start) = self.find_extent(logical_pos)?;
            let (extent_offset, span) = extent_span(&extent, logical_start, logical_pos, to_do - done, self.block_size)?;

            let device_pos = self.device_base + extent.start_block as u64 * self.block_size + extent_offset;
            self.device.read_exact_at(device_pos, &mut buf[done..done + span])?;
            done += span;
        }

        self.position = pos + done as u64;
        Ok(done)
    }
}

impl Read for ForkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_at(self.position, buf).map_err(io::Error::other)
    }
}

impl Write for ForkStream {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "fork streams are read-only"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ForkStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.map.logical_size as i64 + offset,
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

impl SparseStream for ForkStream {
    fn len(&self) -> u64 {
        self.map.logical_size
    }

    fn can_write(&self) -> bool {
        false
    }

    fn stored_extents(&self) -> Vec<StreamExtent> {
        // Every mapped block is stored; the fork's logical space has no
        // holes of its own.
        let mapped = self.map.total_blocks as u64 * self.block_size;
        let stored = mapped.min(self.map.logical_size);
        if stored == 0 {
            Vec::new()
        }
        else {
            vec![StreamExtent::new(0, stored)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::memory::SparseMemoryStream;

    const BS: u64 = 4096;

    fn fork(extents: &[(u32, u32)], total_blocks: u32, logical_size: u64) -> ForkMap {
        let mut map = ForkMap {
            logical_size,
            total_blocks,
            ..ForkMap::default()
        };
        for (i, &(start, count)) in extents.iter().enumerate() {
            map.extents[i] = ExtentDescriptor::new(start, count);
        }
        map
    }

    fn stream(map: ForkMap, overflow: MemoryExtentIndex) -> ForkStream {
        // A device large enough for any block number the tests use.
        let device = SharedStream::from_stream(SparseMemoryStream::new(4096 * BS));
        ForkStream::new(device, Box::new(overflow), map, 42, BS as u32, 0).unwrap()
    }

    #[test]
    fn find_extent_walks_inline_extents() {
        let map = fork(&[(100, 3), (200, 2)], 5, 5 * BS);
        let mut fork = stream(map, MemoryExtentIndex::new());

        let (e, start) = fork.find_extent(0).unwrap();
        assert_eq!((e.start_block, start), (100, 0));

        let (e, start) = fork.find_extent(3 * BS - 1).unwrap();
        assert_eq!((e.start_block, start), (100, 0));

        let (e, start) = fork.find_extent(3 * BS).unwrap();
        assert_eq!((e.start_block, start), (200, 3 * BS));
    }

    #[test]
    fn lookup_past_map_is_beyond_eof() {
        let map = fork(&[(100, 3), (200, 2)], 5, 5 * BS);
        let mut fork = stream(map, MemoryExtentIndex::new());
        assert!(matches!(fork.find_extent(5 * BS), Err(DiskError::BeyondEof)));
    }

    #[test]
    fn spill_lookup_continues_the_map() {
        let map = fork(&[(100, 3), (200, 2)], 9, 9 * BS);
        let mut overflow = MemoryExtentIndex::new();
        overflow.insert(42, 5, &[ExtentDescriptor::new(300, 1), ExtentDescriptor::new(400, 3)]);
        let mut fork = stream(map, overflow);

        let (e, start) = fork.find_extent(5 * BS).unwrap();
        assert_eq!((e.start_block, start), (300, 5 * BS));

        let (e, start) = fork.find_extent(8 * BS).unwrap();
        assert_eq!((e.start_block, start), (400, 6 * BS));
    }

    #[test]
    fn missing_spill_record_is_reported() {
        let map = fork(&[(100, 3), (200, 2)], 7, 7 * BS);
        let mut fork = stream(map, MemoryExtentIndex::new());
        assert!(matches!(
            fork.find_extent(5 * BS),
            Err(DiskError::MissingExtent { file_id: 42, blocks_seen: 5 })
        ));
    }

    #[test]
    fn hole_sentinels_are_skipped_opaquely() {
        // A zero-count descriptor between live extents neither matches nor
        // advances the walk.
        let map = fork(&[(100, 2), (0, 0), (200, 2)], 4, 4 * BS);
        let mut fork = stream(map, MemoryExtentIndex::new());
        let (e, start) = fork.find_extent(2 * BS).unwrap();
        assert_eq!((e.start_block, start), (200, 2 * BS));
    }

    #[test]
    fn zero_progress_spill_record_is_corrupt() {
        let map = fork(&[(100, 2)], 4, 4 * BS);
        let mut overflow = MemoryExtentIndex::new();
        // A continuation record consisting solely of hole sentinels can
        // never account for the remaining blocks.
        overflow.insert(42, 2, &[ExtentDescriptor::new(0, 0)]);
        let mut fork = stream(map, overflow);
        assert!(matches!(fork.find_extent(3 * BS), Err(DiskError::Corrupt(_))));
    }

    #[test]
    fn zero_length_span_is_corrupt_not_silent() {
        // extent_span is the read loop's progress guard: a degenerate
        // descriptor that claims to contain the position but covers zero
        // bytes must surface as corruption, not end the read short.
        let degenerate = ExtentDescriptor::new(100, 0);
        assert!(matches!(
            extent_span(&degenerate, 0, 0, 512, BS),
            Err(DiskError::Corrupt(_))
        ));

        // A consistent descriptor yields the clamped span.
        let extent = ExtentDescriptor::new(100, 2);
        assert_eq!(extent_span(&extent, 0, BS + 1, 64 * 1024, BS).unwrap(), (BS + 1, (BS - 1) as usize));
    }

    #[test]
    fn read_crosses_extents_with_one_access_each() {
        let map = fork(&[(100, 1), (300, 1)], 2, 2 * BS);
        let device = SharedStream::from_stream(SparseMemoryStream::new(4096 * BS));
        device.write_all_at(100 * BS, &vec![0xAA; BS as usize]).unwrap();
        device.write_all_at(300 * BS, &vec![0xBB; BS as usize]).unwrap();

        let mut fork = ForkStream::new(device, Box::new(MemoryExtentIndex::new()), map, 7, BS as u32, 0).unwrap();

        let mut buf = vec![0u8; 2 * BS as usize];
        assert_eq!(fork.read_at(0, &mut buf).unwrap(), 2 * BS as usize);
        assert!(buf[..BS as usize].iter().all(|&b| b == 0xAA));
        assert!(buf[BS as usize..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn read_is_short_at_end_of_fork() {
        // logical_size smaller than the mapped blocks clamps the read.
        let map = fork(&[(100, 2)], 2, BS + 100);
        let mut fork = stream(map, MemoryExtentIndex::new());
        let mut buf = vec![0u8; 2 * BS as usize];
        assert_eq!(fork.read_at(BS, &mut buf).unwrap(), 100);
    }

    #[test]
    fn cancellation_interrupts_between_extents() {
        let map = fork(&[(100, 1), (300, 1)], 2, 2 * BS);
        let cancel = CancelToken::new();
        let mut fork = stream(map, MemoryExtentIndex::new()).with_cancel(cancel.clone());

        cancel.cancel();
        let mut buf = vec![0u8; 16];
        assert!(matches!(fork.read_at(0, &mut buf), Err(DiskError::Cancelled)));
    }

    #[test]
    fn fork_map_record_round_trip() {
        let map = fork(&[(100, 3), (200, 2)], 5, 5 * BS);
        let mut buf = [0u8; FORK_MAP_SIZE];
        assert_eq!(map.write_to(&mut buf).unwrap(), FORK_MAP_SIZE);

        let mut parsed = ForkMap::default();
        assert_eq!(parsed.read_from(&buf).unwrap(), FORK_MAP_SIZE);
        assert_eq!(parsed, map);
        assert_eq!(parsed.size_bytes(), FORK_MAP_SIZE);

        assert!(matches!(
            parsed.read_from(&buf[..FORK_MAP_SIZE - 1]),
            Err(DiskError::SliceTooShort { .. })
        ));
    }

    #[test]
    fn writes_unsupported() {
        let map = fork(&[(100, 1)], 1, BS);
        let mut fork = stream(map, MemoryExtentIndex::new());
        let err = fork.write(&[0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
