//! The rolling window interior shared by every counter type
//!
//! A [`Window`] is a circular buffer of per-second `f64` cells covering
//! `span` seconds. The cell for absolute second `s` is `s mod (span + 1)`.
//! The buffer is one cell longer than the span so that the cell being written
//! 'now' is never also the oldest cell being read out by a dump.
//!
//! Nothing here reads a clock or takes a lock. Every operation is handed the
//! current second explicitly and the owning counter is responsible for
//! serializing access. Stale cells are evicted lazily: each operation first
//! calls [`Window::refresh`], which zeroes exactly the cells that the elapsed
//! seconds since the previous call have made stale. The cost of eviction is
//! proportional to elapsed time, bounded by one full flush.

/// Errors produced by [`Window`] construction
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The span is zero seconds wide.
    #[error("span must be at least one second")]
    ZeroSpan,
    /// The reporting interval is zero seconds wide.
    #[error("interval must be at least one second")]
    ZeroInterval,
    /// The reporting interval does not divide the span.
    #[error("interval of {interval}s does not evenly divide span of {span}s")]
    UnevenInterval {
        /// Window span in seconds
        span: u64,
        /// Reporting interval in seconds
        interval: u64,
    },
    /// The span cannot be addressed on this platform.
    #[error("span of {span}s is too large")]
    SpanTooLarge {
        /// Window span in seconds
        span: u64,
    },
}

/// One aggregated reporting interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Start of the interval, seconds since the epoch.
    pub timestamp: u64,
    /// Sum of the cells in the interval.
    pub value: f64,
}

#[derive(Debug)]
pub(crate) struct Window {
    span: u64,
    interval: u64,
    /// Always `span + 1` long.
    cells: Vec<f64>,
    /// The second of the most recent refresh.
    last: u64,
}

impl Window {
    pub(crate) fn new(span: u64, interval: u64) -> Result<Self, Error> {
        if span == 0 {
            return Err(Error::ZeroSpan);
        }
        if interval == 0 {
            return Err(Error::ZeroInterval);
        }
        if span % interval != 0 {
            return Err(Error::UnevenInterval { span, interval });
        }
        let len = usize::try_from(span)
            .ok()
            .and_then(|span| span.checked_add(1))
            .ok_or(Error::SpanTooLarge { span })?;

        Ok(Self {
            span,
            interval,
            cells: vec![0.0; len],
            last: 0,
        })
    }

    pub(crate) fn span(&self) -> u64 {
        self.span
    }

    pub(crate) fn interval(&self) -> u64 {
        self.interval
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, second: u64) -> usize {
        // `cells.len()` fits in a usize so the remainder does too.
        (second % (self.cells.len() as u64)) as usize
    }

    /// Zero the cells made stale since the previous refresh.
    ///
    /// If more than a full span has elapsed every cell is stale and the whole
    /// buffer is flushed. Otherwise the cells for the seconds `last + 1 ..=
    /// now` still hold data from one buffer-length ago and are zeroed. A clock
    /// that moved backward evicts nothing but still moves `last` to `now`, so
    /// the cells are evicted again as time catches back up.
    pub(crate) fn refresh(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last);
        if elapsed > self.span {
            self.flush();
        } else {
            for back in 0..elapsed {
                let slot = self.slot(now - back);
                self.cells[slot] = 0.0;
            }
        }
        self.last = now;
    }

    pub(crate) fn add(&mut self, now: u64, value: f64) {
        self.refresh(now);
        let slot = self.slot(now);
        self.cells[slot] += value;
    }

    pub(crate) fn set(&mut self, now: u64, value: f64) {
        self.refresh(now);
        let slot = self.slot(now);
        self.cells[slot] = value;
    }

    pub(crate) fn summarize<F, T>(&mut self, now: u64, summary: F) -> T
    where
        F: FnOnce(&[f64]) -> T,
    {
        self.refresh(now);
        summary(&self.cells)
    }

    pub(crate) fn sum(&mut self, now: u64) -> f64 {
        self.summarize(now, |cells| cells.iter().sum())
    }

    pub(crate) fn flush(&mut self) {
        self.cells.fill(0.0);
    }

    /// Aggregate the completed seconds of the window into interval samples.
    ///
    /// The cells are read oldest first, from the second `now - span` up to
    /// `now - 1`; the in-progress current cell is not reported. Each sample is
    /// stamped with the first second of its interval.
    pub(crate) fn samples(&mut self, now: u64) -> Vec<Sample> {
        self.refresh(now);

        let mut samples = Vec::new();
        let mut offset = 0;
        while offset < self.span {
            let value = (offset..offset + self.interval)
                .map(|k| self.cells[self.slot(now + 1 + k)])
                .sum::<f64>();
            samples.push(Sample {
                timestamp: (now + offset).saturating_sub(self.span),
                value,
            });
            offset += self.interval;
        }
        samples
    }
}
