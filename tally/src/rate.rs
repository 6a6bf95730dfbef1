//! Rate counters
//!
//! A [`RateCounter`] is the accumulate-only sibling of
//! [`crate::counter::MetricCounter`]: values are only ever added, there is no
//! overwrite, and the only read is the running sum over the window. It models
//! throughput-like measurements such as request counts. Dumped lines are
//! always `<name> <timestamp> <value>`.

use std::{
    io,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    clock::{Clock, SystemClock},
    counter::{Error, write_samples},
    dumper::Dump,
    format::{Format, Tags},
    sink::Sink,
    window::{Sample, Window},
};

#[derive(Debug)]
/// A rolling-window counter that only accumulates.
pub struct RateCounter<C = SystemClock> {
    name: String,
    clock: C,
    window: Mutex<Window>,
    sink: Mutex<Box<dyn Sink>>,
}

impl<C> RateCounter<C>
where
    C: Clock,
{
    /// Create a new `RateCounter` that dumps to standard output.
    ///
    /// # Errors
    ///
    /// Returns `Error::Window` if the span is zero, the interval is zero, or
    /// the interval does not divide the span.
    pub fn new<N>(name: N, span_secs: u64, interval_secs: u64, clock: C) -> Result<Self, Error>
    where
        N: Into<String>,
    {
        Ok(Self {
            name: name.into(),
            clock,
            window: Mutex::new(Window::new(span_secs, interval_secs)?),
            sink: Mutex::new(Box::new(io::stdout())),
        })
    }

    /// Replace the sink dumped lines are written to.
    #[must_use]
    pub fn with_sink<S>(self, sink: S) -> Self
    where
        S: Sink + 'static,
    {
        Self {
            sink: Mutex::new(Box::new(sink)),
            ..self
        }
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The counter's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.add(1.0);
    }

    /// Add `value` to the current second.
    pub fn add(&self, value: f64) {
        let mut window = self.window();
        window.add(self.clock.now_secs(), value);
    }

    /// The sum over the window, current second included.
    #[must_use]
    pub fn get(&self) -> f64 {
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
        // Rate lines never carry tags.
        write_samples(&self.sink, Format::Plain, &self.name, &Tags::new(), &samples)
    }
}

impl<C> Dump for RateCounter<C>
where
    C: Clock,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn span_secs(&self) -> u64 {
        self.window().span()
    }

    fn dump(&self) -> Result<(), Error> {
        RateCounter::dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::RateCounter;
    use crate::{clock::ManualClock, sink::MemorySink};

    #[test]
    fn adds_within_a_second_accumulate() {
        let clock = ManualClock::at_secs(1_000);
        let rate = RateCounter::new("requests", 15, 1, clock).unwrap();
        rate.add(1.0);
        rate.add(1.0);
        assert_eq!(rate.get(), 2.0);
    }

    #[test]
    fn get_covers_trailing_span_only() {
        let clock = ManualClock::at_secs(1_000);
        let rate = RateCounter::new("requests", 5, 1, clock.clone()).unwrap();
        for _ in 0..8 {
            rate.inc();
            clock.advance_secs(1);
        }
        // Now 1008: seconds 1003 through 1007 carry one each.
        assert_eq!(rate.get(), 5.0);

        clock.advance_secs(6);
        assert_eq!(rate.get(), 0.0);
    }

    #[test]
    fn dump_writes_plain_lines() {
        let clock = ManualClock::at_secs(100);
        let sink = MemorySink::new();
        let rate = RateCounter::new("bytes", 4, 2, clock.clone())
            .unwrap()
            .with_sink(sink.clone());

        rate.add(10.0);
        clock.advance_secs(1);
        rate.add(5.5);
        clock.advance_secs(3);

        rate.dump().unwrap();
        assert_eq!(sink.lines(), vec!["bytes 100 15.5", "bytes 102 0"]);
    }

    #[test]
    fn flush_then_get_is_zero() {
        let clock = ManualClock::at_secs(100);
        let rate = RateCounter::new("requests", 5, 1, clock).unwrap();
        rate.add(3.0);
        rate.flush();
        assert_eq!(rate.get(), 0.0);
    }
}
