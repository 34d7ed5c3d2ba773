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

    src/asynch.rs

    Thin asynchronous adapters over the synchronous surface. The sync
    surface is primary; these helpers run it on a blocking task so async
    callers do not stall their runtime. The cancellation token is checked
    before the operation starts and honored at extent boundaries inside
    multi-extent operations that carry their own token.
*/

use crate::{CancelToken, DiskError, SharedStream};

/// Read up to `count` bytes at `pos` from a shared stream.
pub async fn read_at(stream: SharedStream, pos: u64, count: usize, cancel: CancelToken) -> Result<Vec<u8>, DiskError> {
    tokio::task::spawn_blocking(move || {
        cancel.check()?;
        let mut buf = vec![0u8; count];
        let n = stream.read_at(pos, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    })
    .await
    .map_err(|e| DiskError::Io(e.to_string()))?
}

/// Write all of `data` at `pos` to a shared stream.
pub async fn write_at(stream: SharedStream, pos: u64, data: Vec<u8>, cancel: CancelToken) -> Result<usize, DiskError> {
    tokio::task::spawn_blocking(move || {
        cancel.check()?;
        stream.write_all_at(pos, &data)?;
        Ok(data.len())
    })
    .await
    .map_err(|e| DiskError::Io(e.to_string()))?
}
