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

    tests/common/mod.rs

    Common support routines for tests.
*/

use std::collections::HashMap;

use diskfox::{chain::FileLocator, sparse::memory::SparseMemoryStream, DiskError, SharedStream};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[allow(dead_code)]
pub fn memory_stream(len: u64) -> SharedStream {
    SharedStream::from_stream(SparseMemoryStream::new(len))
}

/// A file locator over a fixed map of path → stream.
#[derive(Default)]
pub struct MapLocator {
    files: HashMap<String, SharedStream>,
}

#[allow(dead_code)]
impl MapLocator {
    pub fn new() -> MapLocator {
        MapLocator::default()
    }

    pub fn insert(&mut self, path: &str, stream: SharedStream) {
        self.files.insert(path.to_string(), stream);
    }
}

impl FileLocator for MapLocator {
    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn open(&self, path: &str, _writable: bool) -> Result<SharedStream, DiskError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| DiskError::Io(format!("no such file: {}", path)))
    }

    fn resolve_absolute(&self, path: &str) -> String {
        path.to_string()
    }
}
