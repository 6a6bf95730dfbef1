//! Destinations for dumped lines
//!
//! A counter owns one [`Sink`] and writes every dumped line to it, flushing
//! once per dump. Standard output is the default. [`FileSink`] and
//! [`MemorySink`] are cheap to clone and clones share one destination, so
//! many counters can dump into the same file or buffer.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

/// Trait for writing dumped lines
///
/// This trait abstracts the destination of dump output, allowing for both
/// stream-based and in-memory implementations.
pub trait Sink: Send + fmt::Debug {
    /// Write bytes to the sink
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush any buffered data
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> io::Result<()>;
}

impl Sink for io::Stdout {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }
}

/// Buffered, append-only file sink
#[derive(Clone, Debug)]
pub struct FileSink {
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl FileSink {
    /// Open `path` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn append<P>(path: P) -> io::Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }
}

impl Sink for FileSink {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

/// In-memory sink
///
/// Accumulates everything written in a shared buffer. Clones share the
/// buffer, so a clone kept aside can inspect what a counter dumped.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    /// Create an empty in-memory sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffer contents as text
    #[must_use]
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// The non-empty lines written so far
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

impl Sink for MemorySink {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
