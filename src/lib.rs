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
*/

//! # diskfox
//!
//! diskfox is a Rust library for reading and writing virtual hard disk
//! images: the layered sparse streams they are made of, the differencing
//! chains that link them to their parents, and the byte-exact on-disk
//! structures that filesystem code parses out of them.
//!
//! The core abstractions are format-neutral:
//!
//! * [`SparseStream`] — a random-access byte stream that knows which of its
//!   ranges are actually stored.
//! * [`LayeredStream`](sparse::layered::LayeredStream) — a stack of sparse
//!   streams where a child image's stored ranges shadow its parent's.
//! * [`DiskChain`](chain::DiskChain) — resolution and verification of a
//!   differencing image's ancestor chain through a host
//!   [`FileLocator`](chain::FileLocator) capability.
//! * [`ForkStream`](fork::ForkStream) — logical-to-device translation
//!   through a run-length extent map with spill-over into a secondary
//!   index.
//! * [`TracingStream`](sparse::tracing::TracingStream) — a pass-through
//!   wrapper that records every operation for replay and debugging.
//!
//! On top of the core, the [`vhd`] module implements Microsoft VHD images
//! (fixed, dynamic and differencing), and [`gpt`] and [`attribute`] supply
//! bit-exact parsers for GPT partition entries and MFT-style attribute
//! records.

pub mod attribute;
pub mod cancel;
pub mod chain;
pub mod codec;
pub mod fork;
pub mod geometry;
pub mod gpt;
pub mod guid;
pub mod io;
pub mod ownership;
pub mod record;
pub mod sparse;
pub mod vhd;

#[cfg(feature = "async")]
pub mod asynch;

use thiserror::Error;

pub use cancel::CancelToken;
pub use geometry::Geometry;
pub use guid::Guid;
pub use ownership::{Ownership, SharedStream, StreamRef};
pub use record::DiskRecord;
pub use sparse::{SparseStream, StreamExtent};

/// The universal sector size of the formats this crate handles.
pub const SECTOR_SIZE: usize = 512;

/// The default block size of sparse VHD images (2 MiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 0x0020_0000;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("an IO error occurred reading or writing the disk image: {0}")]
    Io(String),
    #[error("a structure in the disk image is corrupt: {0}")]
    Corrupt(String),
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("parent image mismatch: expected {expected}, found {found} in {path}")]
    ChainMismatch { expected: Guid, found: Guid, path: String },
    #[error("no parent image found for {child} (tried {tried:?})")]
    ParentNotFound { child: String, tried: Vec<String> },
    #[error("extent map for file {file_id} has no record at block {blocks_seen}")]
    MissingExtent { file_id: u32, blocks_seen: u64 },
    #[error("logical address lies beyond the last extent")]
    BeyondEof,
    #[error("byte slice too short: needed {needed} bytes, got {actual}")]
    SliceTooShort { needed: usize, actual: usize },
    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<io::Error> for DiskError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Unsupported => DiskError::NotSupported("stream operation"),
            _ => DiskError::Io(err.to_string()),
        }
    }
}

impl From<binrw::Error> for DiskError {
    fn from(err: binrw::Error) -> Self {
        DiskError::Io(err.to_string())
    }
}
