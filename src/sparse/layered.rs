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

    src/sparse/layered.rs

    A stack of equal-length sparse streams where the topmost layer that
    stores a range wins. This is the read side of a differencing chain: a
    child image's stored blocks shadow its parent, and ranges stored by no
    layer read as zeros.

    Writes always target the top layer. A range that the top layer does not
    yet store is first promoted into it (the copy-on-write discipline), at
    the stack's promotion granularity, before the new bytes land.
*/

use crate::{
    io,
    io::{Read, Seek, SeekFrom, Write},
    ownership::StreamRef,
    sparse::{subtract_extents, union_extents, SparseStream, StreamExtent},
    DiskError,
};

pub struct LayeredStream {
    /// Layers in priority order; index 0 is the top (writable) layer.
    layers: Vec<StreamRef>,
    length: u64,
    granularity: u64,
    position: u64,
}

impl LayeredStream {
    /// Stack `layers` (top first) with byte promotion granularity.
    pub fn new(layers: Vec<StreamRef>) -> Result<LayeredStream, DiskError> {
        LayeredStream::with_granularity(layers, 1)
    }

    /// Stack `layers` (top first), promoting on multiples of `granularity`
    /// bytes. Differencing disk formats pass their sector or block size
    /// here so that partially-overwritten units are completed from the
    /// layers below.
    pub fn with_granularity(layers: Vec<StreamRef>, granularity: u64) -> Result<LayeredStream, DiskError> {
        if layers.is_empty() {
            return Err(DiskError::Corrupt("layered stream requires at least one layer".to_string()));
        }
        if granularity == 0 {
            return Err(DiskError::Corrupt("promotion granularity must be non-zero".to_string()));
        }

        let length = layers[0].stream().len();
        for (i, layer) in layers.iter().enumerate().skip(1) {
            if layer.stream().len() != length {
                return Err(DiskError::Corrupt(format!(
                    "layer {} length {:#x} differs from stack length {:#x}",
                    i,
                    layer.stream().len(),
                    length
                )));
            }
        }

        Ok(LayeredStream {
            layers,
            length,
            granularity,
            position: 0,
        })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Copy every sub-range of `[start, start + count)` that the top layer
    /// does not yet store up into it, reading the current content of the
    /// stack below (zeros where nothing stores it). The range is widened
    /// outward to the promotion granularity and clipped to the stream
    /// length.
    ///
    /// After promotion the top layer stores the entire (widened) range, so
    /// subsequent reads no longer fall through.
    pub fn promote(&mut self, start: u64, count: u64) -> Result<(), DiskError> {
        if !self.layers[0].stream().can_write() {
            return Err(DiskError::NotSupported("promotion into a read-only top layer"));
        }

        let aligned_start = start - (start % self.granularity);
        let aligned_end = (start + count).div_ceil(self.granularity) * self.granularity;
        let aligned_end = aligned_end.min(self.length);
        if aligned_start >= aligned_end {
            return Ok(());
        }

        let window = StreamExtent::new(aligned_start, aligned_end - aligned_start);
        let stored = self.layers[0].stream().extents_in(window.start, window.length);
        let gaps = subtract_extents(&[window], &stored);

        for gap in gaps {
            let mut buf = vec![0u8; gap.length as usize];
            read_merged(&self.layers[1..], gap.start, &mut buf)?;
            self.layers[0].stream().write_all_at(gap.start, &buf)?;
        }
        Ok(())
    }
}

/// Fill `buf` from the topmost of `layers` storing each sub-range of
/// `[start, start + buf.len())`; bytes stored by no layer are zeros.
fn read_merged(layers: &[StreamRef], start: u64, buf: &mut [u8]) -> io::Result<()> {
    buf.fill(0);
    let mut uncovered = vec![StreamExtent::new(start, buf.len() as u64)];

    for layer in layers {
        if uncovered.is_empty() {
            break;
        }
        let mut covered = Vec::new();
        for gap in &uncovered {
            for ext in layer.stream().extents_in(gap.start, gap.length) {
                let lo = (ext.start - start) as usize;
                let hi = lo + ext.length as usize;
                layer.stream().read_exact_at(ext.start, &mut buf[lo..hi])?;
                covered.push(ext);
            }
        }
        uncovered = subtract_extents(&uncovered, &covered);
    }
    Ok(())
}

impl Read for LayeredStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.length.saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        read_merged(&self.layers, self.position, &mut buf[..n])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for LayeredStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.layers[0].stream().can_write() {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "layer stack is read-only"));
        }
        let end = self.position + buf.len() as u64;
        if end > self.length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past the end of a fixed-length layer stack",
            ));
        }

        // Complete any partially-written promotion units at the flanks from
        // the layers below, then land the new bytes in the top layer.
        let lead = self.position - (self.position % self.granularity);
        if lead < self.position {
            self.promote(lead, self.position - lead).map_err(io::Error::other)?;
        }
        let tail = end.div_ceil(self.granularity) * self.granularity;
        if tail > end {
            self.promote(end, tail - end).map_err(io::Error::other)?;
        }

        self.layers[0].stream().write_all_at(self.position, buf)?;
        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.layers[0].stream().flush()
    }
}

impl Seek for LayeredStream {
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

impl SparseStream for LayeredStream {
    fn len(&self) -> u64 {
        self.length
    }

    fn can_write(&self) -> bool {
        self.layers[0].stream().can_write()
    }

    fn stored_extents(&self) -> Vec<StreamExtent> {
        self.layers
            .iter()
            .fold(Vec::new(), |acc, layer| union_extents(&acc, &layer.stream().stored_extents()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ownership::{Ownership, SharedStream},
        sparse::clip_extents,
    };

    /// A test stream with byte-precise stored ranges over a backing buffer.
    struct StripeStream {
        data: Vec<u8>,
        stored: Vec<StreamExtent>,
        position: u64,
        writable: bool,
    }

    impl StripeStream {
        fn new(data: Vec<u8>, stored: Vec<StreamExtent>, writable: bool) -> StripeStream {
            StripeStream {
                data,
                stored,
                position: 0,
                writable,
            }
        }
    }

    impl Read for StripeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let remaining = (self.data.len() as u64).saturating_sub(self.position);
            let n = (buf.len() as u64).min(remaining) as usize;
            let pos = self.position as usize;
            buf[..n].copy_from_slice(&self.data[pos..pos + n]);
            self.position += n as u64;
            Ok(n)
        }
    }

    impl Write for StripeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.writable {
                return Err(io::Error::new(io::ErrorKind::Unsupported, "read-only"));
            }
            let pos = self.position as usize;
            self.data[pos..pos + buf.len()].copy_from_slice(buf);
            self.stored = union_extents(&self.stored, &[StreamExtent::new(self.position, buf.len() as u64)]);
            self.position += buf.len() as u64;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for StripeStream {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            if let SeekFrom::Start(offset) = pos {
                self.position = offset;
            }
            Ok(self.position)
        }
    }

    impl SparseStream for StripeStream {
        fn len(&self) -> u64 {
            self.data.len() as u64
        }

        fn can_write(&self) -> bool {
            self.writable
        }

        fn stored_extents(&self) -> Vec<StreamExtent> {
            self.stored.clone()
        }

        fn extents_in(&self, start: u64, count: u64) -> Vec<StreamExtent> {
            clip_extents(&self.stored, StreamExtent::new(start, count))
        }
    }

    fn stack_two() -> (LayeredStream, SharedStream, SharedStream) {
        // Top stores [1000..2000) of 0x11; bottom stores [0..4096) of 0x22.
        let top = SharedStream::from_stream(StripeStream::new(
            vec![0x11; 4096],
            vec![StreamExtent::new(1000, 1000)],
            true,
        ));
        let bottom = SharedStream::from_stream(StripeStream::new(
            vec![0x22; 4096],
            vec![StreamExtent::new(0, 4096)],
            false,
        ));
        let stack = LayeredStream::new(vec![
            StreamRef::new(top.clone(), Ownership::None),
            StreamRef::new(bottom.clone(), Ownership::None),
        ])
        .unwrap();
        (stack, top, bottom)
    }

    #[test]
    fn top_layer_shadows_bottom() {
        let (mut stack, _top, _bottom) = stack_two();

        let mut buf = vec![0u8; 2000];
        stack.read_exact_at(500, &mut buf).unwrap();

        assert!(buf[..500].iter().all(|&b| b == 0x22), "[500..1000) from bottom");
        assert!(buf[500..1500].iter().all(|&b| b == 0x11), "[1000..2000) from top");
        assert!(buf[1500..].iter().all(|&b| b == 0x22), "[2000..2500) from bottom");
    }

    #[test]
    fn unstored_ranges_read_zero() {
        let top = SharedStream::from_stream(StripeStream::new(vec![0x11; 8192], vec![], true));
        let bottom = SharedStream::from_stream(StripeStream::new(
            vec![0x22; 8192],
            vec![StreamExtent::new(0, 100)],
            false,
        ));
        let mut stack = LayeredStream::new(vec![
            StreamRef::new(top, Ownership::None),
            StreamRef::new(bottom, Ownership::None),
        ])
        .unwrap();

        let mut buf = [0xFFu8; 200];
        stack.read_exact_at(0, &mut buf).unwrap();
        assert!(buf[..100].iter().all(|&b| b == 0x22));
        assert!(buf[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stored_extents_is_union_of_layers() {
        let (stack, _top, _bottom) = stack_two();
        assert_eq!(stack.stored_extents(), vec![StreamExtent::new(0, 4096)]);
    }

    #[test]
    fn write_promotes_flanking_units() {
        // 512-byte promotion units; top stores nothing, bottom is all 0x22.
        let top = SharedStream::from_stream(StripeStream::new(vec![0u8; 4096], vec![], true));
        let bottom = SharedStream::from_stream(StripeStream::new(
            vec![0x22; 4096],
            vec![StreamExtent::new(0, 4096)],
            false,
        ));
        let mut stack = LayeredStream::with_granularity(
            vec![
                StreamRef::new(top.clone(), Ownership::None),
                StreamRef::new(bottom, Ownership::None),
            ],
            512,
        )
        .unwrap();

        // Write 100 bytes straddling the unit boundary at 512.
        stack.write_all_at(480, &[0x33; 100]).unwrap();

        // Both touched units are now fully stored in the top layer.
        assert_eq!(top.extents_in(0, 4096), vec![StreamExtent::new(0, 1024)]);

        // The completed flanks carry the bottom layer's bytes.
        let mut buf = [0u8; 1024];
        top.read_exact_at(0, &mut buf).unwrap();
        assert!(buf[..480].iter().all(|&b| b == 0x22));
        assert!(buf[480..580].iter().all(|&b| b == 0x33));
        assert!(buf[580..].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn explicit_promote_copies_lower_content() {
        let (mut stack, top, _bottom) = stack_two();

        stack.promote(0, 4096).unwrap();
        assert_eq!(top.extents_in(0, 4096), vec![StreamExtent::new(0, 4096)]);

        // Promotion preserved what the stack read: top bytes where top
        // stored, bottom bytes elsewhere.
        let mut buf = vec![0u8; 4096];
        top.read_exact_at(0, &mut buf).unwrap();
        assert!(buf[..1000].iter().all(|&b| b == 0x22));
        assert!(buf[1000..2000].iter().all(|&b| b == 0x11));
        assert!(buf[2000..].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn mismatched_layer_lengths_rejected() {
        let a = SharedStream::from_stream(StripeStream::new(vec![0; 4096], vec![], true));
        let b = SharedStream::from_stream(StripeStream::new(vec![0; 8192], vec![], false));
        let result = LayeredStream::new(vec![
            StreamRef::new(a, Ownership::None),
            StreamRef::new(b, Ownership::None),
        ]);
        assert!(matches!(result, Err(DiskError::Corrupt(_))));
    }

    #[test]
    fn read_only_stack_rejects_writes() {
        let top = SharedStream::from_stream(StripeStream::new(vec![0; 4096], vec![], false));
        let mut stack = LayeredStream::new(vec![StreamRef::new(top, Ownership::None)]).unwrap();
        assert!(stack.write_all_at(0, &[1]).is_err());
        assert!(matches!(stack.promote(0, 512), Err(DiskError::NotSupported(_))));
    }
}
