//! Output capture buffers.
//!
//! Guests and child processes produce output one unit (byte) or one chunk at
//! a time; callers want whole lines or whole streams. Two policies are
//! provided:
//! - [`LineBuffer`]: delivers each completed line to a pluggable sink
//! - [`BlockBuffer`]: accumulates a whole stream, delivered once at exit
//!
//! [`LineCollector`] is a ready-made sink that gathers delivered lines.

use std::sync::Arc;

use parking_lot::Mutex;

/// Marker appended when a stream exceeded its byte cap.
pub const TRUNCATION_MARKER: &str = "[output truncated]";

/// Destination for completed lines.
pub type LineSink = Box<dyn FnMut(&str) + Send>;

/// Which standard stream a unit was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Map a file descriptor number to a stream.
    ///
    /// Returns `None` for anything other than 1 (stdout) or 2 (stderr).
    pub fn from_fd(fd: i32) -> Option<Self> {
        match fd {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// Line-granularity capture buffer.
///
/// Units are appended to a pending line. A line feed hands the pending line
/// (decoded lossily, without the line feed) to the sink and clears it. With no
/// sink installed the stream is muted: completed lines are dropped.
///
/// A pending line never grows past the configured limit; units beyond it are
/// discarded until the next line feed.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    limit: Option<usize>,
    sink: Option<LineSink>,
}

impl LineBuffer {
    /// Create a muted buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one unit, flushing to the sink on a line feed.
    pub fn push(&mut self, unit: u8) {
        if unit == b'\n' {
            self.deliver();
        } else if self.limit.is_none_or(|limit| self.pending.len() < limit) {
            self.pending.push(unit);
        }
    }

    /// Append a run of units.
    pub fn push_slice(&mut self, units: &[u8]) {
        for &unit in units {
            self.push(unit);
        }
    }

    /// Replace the flush target. `None` mutes the stream.
    pub fn set_sink(&mut self, sink: Option<LineSink>) {
        self.sink = sink;
    }

    /// Bound the pending line to `limit` bytes. `None` removes the bound.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
        if let Some(limit) = limit {
            self.pending.truncate(limit);
        }
    }

    /// Whether a sink is currently installed.
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver a pending partial line, if any.
    ///
    /// Called once the producer has finished, so output without a trailing
    /// newline is not lost.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.deliver();
        }
    }

    /// Discard any pending partial line without delivering it.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Bytes accumulated since the last delivery.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    fn deliver(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            let line = String::from_utf8_lossy(&self.pending);
            sink(&line);
        }
        self.pending.clear();
    }
}

impl std::fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineBuffer")
            .field("pending_len", &self.pending.len())
            .field("limit", &self.limit)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

/// Sink that gathers delivered lines up to a byte cap.
///
/// Clones share the same storage, so one clone can be handed to a
/// [`LineBuffer`] while another reads the result.
#[derive(Debug, Clone)]
pub struct LineCollector {
    inner: Arc<Mutex<Collected>>,
}

#[derive(Debug, Default)]
struct Collected {
    lines: Vec<String>,
    bytes: usize,
    cap: usize,
    truncated: bool,
}

impl LineCollector {
    /// Create a collector that keeps at most `cap` bytes of line content.
    pub fn with_cap(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Collected {
                cap,
                ..Default::default()
            })),
        }
    }

    /// A sink feeding this collector.
    pub fn sink(&self) -> LineSink {
        let inner = Arc::clone(&self.inner);
        Box::new(move |line: &str| {
            let mut collected = inner.lock();
            if collected.truncated {
                return;
            }
            let cost = line.len() + 1;
            if collected.bytes + cost > collected.cap {
                collected.truncated = true;
                return;
            }
            collected.bytes += cost;
            collected.lines.push(line.to_string());
        })
    }

    /// Lines delivered so far.
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().lines.clone()
    }

    /// Whether any line was dropped because of the cap.
    pub fn is_truncated(&self) -> bool {
        self.inner.lock().truncated
    }

    /// The byte cap this collector was created with.
    pub fn cap(&self) -> usize {
        self.inner.lock().cap
    }

    /// Join the collected lines back into stream text.
    ///
    /// `trailing` is the partial line (if any) that had no line feed. It is
    /// charged against the same cap; whatever does not fit is cut off.
    pub fn into_text(self, trailing: Option<&str>) -> String {
        let collected = self.inner.lock();
        let mut truncated = collected.truncated;
        let mut text = String::with_capacity(collected.bytes);
        for line in &collected.lines {
            text.push_str(line);
            text.push('\n');
        }
        if let Some(rest) = trailing.filter(|_| !truncated) {
            let remaining = collected.cap.saturating_sub(collected.bytes);
            if rest.len() <= remaining {
                text.push_str(rest);
            } else {
                text.push_str(&rest[..floor_char_boundary(rest, remaining)]);
                truncated = true;
            }
        }
        if truncated {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Whole-stream capture buffer with a byte cap.
#[derive(Debug, Default)]
pub struct BlockBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl BlockBuffer {
    /// Create a buffer holding at most `cap` bytes.
    pub fn with_cap(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append a chunk, dropping whatever exceeds the cap.
    pub fn extend(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.cap.saturating_sub(self.data.len());
        if chunk.len() <= remaining {
            self.data.extend_from_slice(chunk);
        } else {
            self.data.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        }
    }

    /// Whether bytes were dropped because of the cap.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Deliver the whole stream as one string.
    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}
