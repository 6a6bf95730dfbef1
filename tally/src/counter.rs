//! Windowed metric counters
//!
//! A [`MetricCounter`] records per-second values over a rolling window of
//! `span_secs` seconds and reports them in `interval_secs` chunks. It supports
//! both increment semantics, [`MetricCounter::add`], and point-sample
//! semantics, [`MetricCounter::set`], which overwrites the current second.
//!
//! Counters are shared between producer code, which mutates them, and a
//! [`crate::dumper::PeriodicDumper`], which reads and evicts them. All access
//! to the cells goes through one mutex.

use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    clock::{Clock, SystemClock},
    dumper::Dump,
    format::{self, Format, Tags},
    registry::Registry,
    sink::Sink,
    window::{self, Sample, Window},
};

const DEFAULT_SPAN_SECS: u64 = 15;
const DEFAULT_INTERVAL_SECS: u64 = 1;

/// Errors produced by counters
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The window geometry is invalid.
    #[error("Invalid window: {0}")]
    Window(#[from] window::Error),
    /// Wrapper around [`io::Error`].
    #[error("[{context}] Io error: {err}")]
    Io {
        /// The context for the error, simple tag
        context: &'static str,
        /// The underlying error
        err: io::Error,
    },
}

/// Render `samples` with `format` and write them to `sink` in one go.
pub(crate) fn write_samples(
    sink: &Mutex<Box<dyn Sink>>,
    format: Format,
    name: &str,
    tags: &Tags,
    samples: &[Sample],
) -> Result<(), Error> {
    let mut out = String::new();
    for sample in samples {
        out.push_str(&format.line(name, sample.timestamp, sample.value, tags));
    }

    let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
    sink.write_all(out.as_bytes()).map_err(|err| Error::Io {
        context: "dump write",
        err,
    })?;
    sink.flush().map_err(|err| Error::Io {
        context: "flush",
        err,
    })?;
    Ok(())
}

/// Builder for [`MetricCounter`]
#[derive(Debug)]
#[must_use]
pub struct Builder {
    name: String,
    span_secs: u64,
    interval_secs: u64,
    tags: Tags,
    format: Format,
    sink: Option<Box<dyn Sink>>,
    registry: Option<Registry>,
}

impl Builder {
    /// Width of the rolling window in seconds. Defaults to 15.
    pub fn span_secs(mut self, span_secs: u64) -> Self {
        self.span_secs = span_secs;
        self
    }

    /// Width of each reported chunk in seconds. Must divide the span.
    /// Defaults to 1.
    pub fn interval_secs(mut self, interval_secs: u64) -> Self {
        self.interval_secs = interval_secs;
        self
    }

    /// Tags appended to every dumped line.
    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Line template. Defaults to [`Format::Plain`].
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Where dumped lines go. Defaults to standard output.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: Sink + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Track the built counter in `registry`.
    pub fn registry(mut self, registry: &Registry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// Build the counter.
    ///
    /// # Errors
    ///
    /// Returns `Error::Window` if the span is zero, the interval is zero, or
    /// the interval does not divide the span.
    pub fn build<C>(self, clock: C) -> Result<Arc<MetricCounter<C>>, Error>
    where
        C: Clock + 'static,
    {
        let window = Window::new(self.span_secs, self.interval_secs)?;
        let tags = self.format.resolve_tags(self.tags, format::hostname);
        let sink = self
            .sink
            .unwrap_or_else(|| Box::new(io::stdout()) as Box<dyn Sink>);

        let counter = Arc::new(MetricCounter {
            name: self.name,
            tags,
            format: self.format,
            clock,
            window: Mutex::new(window),
            sink: Mutex::new(sink),
        });
        if let Some(registry) = self.registry {
            registry.register(Arc::clone(&counter) as Arc<dyn Dump>);
        }
        Ok(counter)
    }
}

#[derive(Debug)]
/// A rolling-window counter with increment and overwrite semantics.
pub struct MetricCounter<C = SystemClock> {
    name: String,
    tags: Tags,
    format: Format,
    clock: C,
    window: Mutex<Window>,
    sink: Mutex<Box<dyn Sink>>,
}

impl MetricCounter<SystemClock> {
    /// Start building a counter named `name`.
    pub fn builder<N>(name: N) -> Builder
    where
        N: Into<String>,
    {
        Builder {
            name: name.into(),
            span_secs: DEFAULT_SPAN_SECS,
            interval_secs: DEFAULT_INTERVAL_SECS,
            tags: Tags::new(),
            format: Format::default(),
            sink: None,
            registry: None,
        }
    }
}

impl<C> MetricCounter<C>
where
    C: Clock,
{
    fn window(&self) -> MutexGuard<'_, Window> {
        // Cells are plain numbers, a panic mid-update leaves them usable.
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The counter's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tags carried by every line, after format resolution.
    #[must_use]
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Width of the rolling window in seconds.
    #[must_use]
    pub fn span_secs(&self) -> u64 {
        self.window().span()
    }

    /// Width of each reported chunk in seconds.
    #[must_use]
    pub fn interval_secs(&self) -> u64 {
        self.window().interval()
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.add(1.0);
    }

    /// Add `value` to the current second. Negative values decrement.
    pub fn add(&self, value: f64) {
        let mut window = self.window();
        window.add(self.clock.now_secs(), value);
    }

    /// Overwrite the current second with `value`.
    pub fn set(&self, value: f64) {
        let mut window = self.window();
        window.set(self.clock.now_secs(), value);
    }

    /// Apply `summary` to every cell of the window, current second included.
    pub fn summarize<F, T>(&self, summary: F) -> T
    where
        F: FnOnce(&[f64]) -> T,
    {
        let mut window = self.window();
        window.summarize(self.clock.now_secs(), summary)
    }

    /// The sum over the window, current second included.
    #[must_use]
    pub fn get_sum(&self) -> f64 {
        let mut window = self.window();
        window.sum(self.clock.now_secs())
    }

    /// Zero every cell.
    pub fn flush(&self) {
        self.window().flush();
    }

    /// The samples a dump would emit right now, oldest first.
    #[must_use]
    pub fn report(&self) -> Vec<Sample> {
        let mut window = self.window();
        window.samples(self.clock.now_secs())
    }

    /// Write one line per completed interval of the window to the sink.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sink cannot be written or flushed.
    pub fn dump(&self) -> Result<(), Error> {
        let samples = self.report();
        write_samples(&self.sink, self.format, &self.name, &self.tags, &samples)
    }
}

impl<C> Dump for MetricCounter<C>
where
    C: Clock,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn span_secs(&self) -> u64 {
        MetricCounter::span_secs(self)
    }

    fn dump(&self) -> Result<(), Error> {
        MetricCounter::dump(self)
    }
}
