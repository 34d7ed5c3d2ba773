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

    src/geometry.rs

    Cylinder/head/sector geometry for hard disk images. Most virtual disk
    formats only care about capacity, but VHD records a BIOS-style geometry
    in its footer, derived from capacity by a fixed algorithm so that all
    implementations agree on it.
*/

use std::fmt::Display;

use crate::SECTOR_SIZE;

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Default)]
pub struct Geometry {
    c: u16,
    h: u8,
    s: u8,
}

impl From<(u16, u8, u8)> for Geometry {
    fn from((c, h, s): (u16, u8, u8)) -> Self {
        Self { c, h, s }
    }
}

impl Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[c:{} h:{} s:{}]", self.c, self.h, self.s)
    }
}

impl Geometry {
    pub fn new(c: u16, h: u8, s: u8) -> Self {
        Self { c, h, s }
    }

    pub fn get(&self) -> (u16, u8, u8) {
        (self.c, self.h, self.s)
    }

    pub fn c(&self) -> u16 {
        self.c
    }

    pub fn h(&self) -> u8 {
        self.h
    }

    pub fn s(&self) -> u8 {
        self.s
    }

    pub fn total_sectors(&self) -> u64 {
        self.c as u64 * self.h as u64 * self.s as u64
    }

    pub fn capacity(&self) -> u64 {
        self.total_sectors() * SECTOR_SIZE as u64
    }

    /// Derive a BIOS geometry from a byte capacity using the algorithm in
    /// the VHD specification. The geometry's capacity may round down from
    /// the requested one; the footer records both.
    pub fn from_capacity(capacity: u64) -> Geometry {
        let total_sectors = (capacity / SECTOR_SIZE as u64).min(65535 * 16 * 255);

        let mut sectors_per_track: u64;
        let mut heads: u64;
        let mut cylinder_times_heads: u64;

        if total_sectors >= 65535 * 16 * 63 {
            sectors_per_track = 255;
            heads = 16;
            cylinder_times_heads = total_sectors / sectors_per_track;
        }
        else {
            sectors_per_track = 17;
            cylinder_times_heads = total_sectors / sectors_per_track;
            heads = ((cylinder_times_heads + 1023) / 1024).max(4);

            if cylinder_times_heads >= heads * 1024 || heads > 16 {
                sectors_per_track = 31;
                heads = 16;
                cylinder_times_heads = total_sectors / sectors_per_track;
                if cylinder_times_heads >= heads * 1024 {
                    sectors_per_track = 63;
                    cylinder_times_heads = total_sectors / sectors_per_track;
                }
            }
        }

        Geometry::new((cylinder_times_heads / heads) as u16, heads as u8, sectors_per_track as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_disk_geometry() {
        // 10 MiB: 20480 sectors, 17 spt, 4 heads.
        let geom = Geometry::from_capacity(10 * 1024 * 1024);
        assert_eq!(geom.s(), 17);
        assert_eq!(geom.h(), 4);
        assert_eq!(geom.c(), (20480 / 17) / 4);
    }

    #[test]
    fn large_disk_caps_at_max_chs() {
        let geom = Geometry::from_capacity(2 * 1024 * 1024 * 1024 * 1024);
        assert_eq!(geom.get(), (65535, 16, 255));
    }

    #[test]
    fn geometry_capacity_not_above_requested() {
        for mib in [3u64, 16, 127, 500, 2048] {
            let capacity = mib * 1024 * 1024;
            let geom = Geometry::from_capacity(capacity);
            assert!(geom.capacity() <= capacity, "geometry {} exceeds {}", geom, capacity);
        }
    }
}
