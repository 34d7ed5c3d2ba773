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

    src/sparse/tracing.rs

    A pass-through stream wrapper that records every operation on the
    wrapped stream for replay and debugging. Records are append-only and
    ordered by operation completion; a failing operation is recorded and
    then re-raised unchanged, so tracing never swallows an error.
*/

use std::{
    backtrace::Backtrace,
    fmt::{Display, Formatter},
    fs::File,
    path::Path,
};

use crate::{
    io,
    io::{Read, Seek, SeekFrom, Write},
    ownership::StreamRef,
    sparse::{SparseStream, StreamExtent},
    DiskError,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraceActivity {
    Read,
    Write,
}

impl Display for TraceActivity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceActivity::Read => write!(f, "READ"),
            TraceActivity::Write => write!(f, "WRITE"),
        }
    }
}

/// One observed operation on the wrapped stream.
#[derive(Clone, Debug)]
pub struct TraceRecord {
    pub seq: u64,
    pub activity: TraceActivity,
    /// The wrapped stream's position before the operation.
    pub position: u64,
    /// Bytes requested.
    pub count: usize,
    /// Bytes transferred, or -1 when the operation failed.
    pub result: i64,
    /// The failure, rendered as "kind: message", when `result` is -1.
    pub error: Option<String>,
    /// A captured call stack, when stack capture is enabled.
    pub stack: Option<String>,
}

impl TraceRecord {
    fn line(&self) -> String {
        let mut line = format!(
            "{} {} @pos={:x} count={} result={}",
            self.seq, self.activity, self.position, self.count, self.result
        );
        if let Some(error) = &self.error {
            line.push_str(&format!(" exc={}", error));
        }
        line
    }
}

/// Wraps a stream and records read and write traffic.
///
/// Tracing starts disabled. By default only writes are traced once
/// started; reads can be opted in. An optional file sink receives one line
/// per record (flushed immediately, so a crash leaves a consistent trace
/// prefix) in addition to the in-memory record vector.
pub struct TracingStream {
    inner: StreamRef,
    active: bool,
    trace_reads: bool,
    trace_writes: bool,
    capture_stack: bool,
    records: Vec<TraceRecord>,
    next_seq: u64,
    sink: Option<File>,
}

impl TracingStream {
    pub fn new(inner: StreamRef) -> TracingStream {
        TracingStream {
            inner,
            active: false,
            trace_reads: false,
            trace_writes: true,
            capture_stack: false,
            records: Vec::new(),
            next_seq: 0,
            sink: None,
        }
    }

    /// Begin recording.
    pub fn start(&mut self) {
        self.active = true;
    }

    /// Stop recording. Accumulated records are retained.
    pub fn stop(&mut self) {
        self.active = false;
    }

    /// Discard all accumulated records and optionally start recording.
    pub fn reset(&mut self, start: bool) {
        self.records.clear();
        self.next_seq = 0;
        self.active = start;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_trace_reads(&mut self, enable: bool) {
        self.trace_reads = enable;
    }

    pub fn set_trace_writes(&mut self, enable: bool) {
        self.trace_writes = enable;
    }

    pub fn set_capture_stack(&mut self, enable: bool) {
        self.capture_stack = enable;
    }

    /// Mirror all future records to a text file, replacing (and closing)
    /// any previous sink. May be called at any time.
    pub fn write_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), DiskError> {
        let file = File::create(path)?;
        self.sink = Some(file);
        Ok(())
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    fn log(&mut self, activity: TraceActivity, position: u64, count: usize, result: &io::Result<usize>) {
        let (result, error) = match result {
            Ok(n) => (*n as i64, None),
            Err(e) => (-1, Some(format!("{:?}: {}", e.kind(), e))),
        };
        let stack = self.capture_stack.then(|| Backtrace::force_capture().to_string());

        let record = TraceRecord {
            seq: self.next_seq,
            activity,
            position,
            count,
            result,
            error,
            stack,
        };
        self.next_seq += 1;

        if let Some(sink) = &mut self.sink {
            let mut text = record.line();
            text.push('\n');
            if let Some(stack) = &record.stack {
                for frame in stack.lines() {
                    text.push_str("    ");
                    text.push_str(frame);
                    text.push('\n');
                }
            }
            if let Err(e) = sink.write_all(text.as_bytes()).and_then(|_| sink.flush()) {
                log::warn!("trace sink write failed: {}", e);
            }
        }

        self.records.push(record);
    }
}

impl Read for TracingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let position = self.inner.stream_mut().stream_position()?;
        let result = self.inner.stream_mut().read(buf);
        if self.active && self.trace_reads {
            self.log(TraceActivity::Read, position, buf.len(), &result);
        }
        result
    }
}

impl Write for TracingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let position = self.inner.stream_mut().stream_position()?;
        let result = self.inner.stream_mut().write(buf);
        if self.active && self.trace_writes {
            self.log(TraceActivity::Write, position, buf.len(), &result);
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.stream_mut().flush()
    }
}

impl Seek for TracingStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.stream_mut().seek(pos)
    }
}

impl SparseStream for TracingStream {
    fn len(&self) -> u64 {
        self.inner.stream().len()
    }

    fn can_write(&self) -> bool {
        self.inner.stream().can_write()
    }

    fn set_stream_len(&mut self, len: u64) -> Result<(), DiskError> {
        self.inner.stream().set_stream_len(len)
    }

    fn stored_extents(&self) -> Vec<StreamExtent> {
        self.inner.stream().stored_extents()
    }

    fn extents_in(&self, start: u64, count: u64) -> Vec<StreamExtent> {
        self.inner.stream().extents_in(start, count)
    }
}
