//! Line-atomic output multiplexing for concurrent workers
//!
//! Every worker writes through its own [`OutputMux`], which buffers partial
//! lines and forwards only complete lines, prefixed, to one [`SharedSink`].
//! The sink serializes whole-line writes, so lines from different workers
//! can be interleaved with each other but never spliced together.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared, mutex-guarded line sink.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// In-memory sink plus a handle to read what was written.
    pub fn buffer() -> (Self, MemoryBuffer) {
        let buffer = MemoryBuffer::default();
        (Self::new(buffer.clone()), buffer)
    }

    /// Write one whole line, appending the terminator.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        self.write_prefixed(b"", line.as_bytes())
    }

    /// Build a multiplexer for one worker.
    pub fn mux(&self, prefix: impl Into<String>) -> OutputMux {
        OutputMux::new(prefix, self.clone())
    }

    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }

    fn write_prefixed(&self, prefix: &[u8], line: &[u8]) -> io::Result<()> {
        let mut record = Vec::with_capacity(prefix.len() + line.len() + 1);
        record.extend_from_slice(prefix);
        record.extend_from_slice(line);
        record.push(b'\n');
        self.lock().write_all(&record)
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSink")
    }
}

/// Per-worker writer that forwards only complete, prefixed lines.
///
/// One instance belongs to one worker; it is `Send` but not shared.
/// Retained partial content is forwarded on `flush` and on drop.
///
/// `write` only counts bytes as written once the lines they complete reached
/// the sink. A failed emit leaves that line's text pending and reports the
/// bytes accepted so far, so `write_all` resumes without repeating output.
pub struct OutputMux {
    prefix: String,
    sink: SharedSink,
    pending: Vec<u8>,
}

impl OutputMux {
    pub fn new(prefix: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            prefix: prefix.into(),
            sink,
            pending: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Convenience for writing text that may or may not end in a newline.
    pub fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.write_all(text.as_bytes())
    }

    fn emit(&self, mut line: &[u8]) -> io::Result<()> {
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        self.sink.write_prefixed(self.prefix.as_bytes(), line)
    }
}

impl Write for OutputMux {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut consumed = 0;
        while let Some(offset) = buf[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            let mut line = std::mem::take(&mut self.pending);
            let held = line.len();
            line.extend_from_slice(&buf[consumed..end]);
            let emitted = self.emit(&line);
            line.truncate(held);
            if let Err(e) = emitted {
                self.pending = line;
                return if consumed == 0 { Err(e) } else { Ok(consumed) };
            }
            line.clear();
            self.pending = line;
            consumed = end + 1;
        }
        self.pending.extend_from_slice(&buf[consumed..]);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.emit(&self.pending)?;
            self.pending.clear();
        }
        self.sink.flush()
    }
}

impl Drop for OutputMux {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// `Write` target that accumulates bytes in memory.
#[derive(Clone, Default)]
pub struct MemoryBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl Write for MemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
