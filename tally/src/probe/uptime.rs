//! The `/proc/uptime` probe.
//!
//! ## Counters
//!
//! `proc.uptime.since_boot`: Whole seconds since boot
//! `proc.uptime.idle`: Whole seconds the CPUs have spent idle, summed
//!
//! Both are point samples taken once per span and reported as a single
//! interval.

use std::{
    num::NonZeroU64,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;
use tally_signal::Listener;
use tracing::debug;

use super::Context;
use crate::{
    clock::Clock,
    counter::MetricCounter,
    ticker::run_every_n_seconds,
    window::{self, Window},
};

/// Errors produced by [`Uptime`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`]
    #[error("Failed to read {path:?}: {source}")]
    Io {
        /// The file being read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// Unable to parse the uptime file
    #[error("uptime malformed: {0}")]
    Malformed(&'static str),
    /// Unable to parse floating point
    #[error("Float Parsing: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
}

/// Default span, and sampling period, in seconds
#[must_use]
pub fn default_span_seconds() -> u64 {
    120
}

/// Default location of the uptime file
#[must_use]
pub fn default_path() -> PathBuf {
    PathBuf::from("/proc/uptime")
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Uptime`]
pub struct Config {
    /// Seconds between samples, also the window span
    #[serde(default = "default_span_seconds")]
    pub span_seconds: u64,
    /// The uptime file to read
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), window::Error> {
        Window::new(self.span_seconds, self.span_seconds).map(drop)
    }
}

/// Parse the uptime file into whole `(since_boot, idle)` seconds.
///
/// # Errors
///
/// Function errors if the contents do not hold two non-negative numbers.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse(contents: &str) -> Result<(u64, u64), Error> {
    let mut fields = contents.split_whitespace();
    let since_boot: f64 = fields
        .next()
        .ok_or(Error::Malformed("uptime empty"))?
        .parse()?;
    let idle: f64 = fields
        .next()
        .ok_or(Error::Malformed("idle time missing"))?
        .parse()?;
    if since_boot < 0.0 || idle < 0.0 {
        return Err(Error::Malformed("negative duration"));
    }
    // Truncation toward zero is the intent.
    Ok((since_boot as u64, idle as u64))
}

#[derive(Debug)]
/// The uptime probe.
pub struct Uptime<C> {
    path: PathBuf,
    period: NonZeroU64,
    clock: C,
    since_boot: Arc<MetricCounter<C>>,
    idle: Arc<MetricCounter<C>>,
}

impl<C> Uptime<C>
where
    C: Clock + Clone + 'static,
{
    /// Create a new [`Uptime`] probe
    ///
    /// # Errors
    ///
    /// Function will return an error if the span is zero.
    pub fn new(config: &Config, clock: C, context: &Context) -> Result<Self, super::Error> {
        let period = NonZeroU64::new(config.span_seconds).ok_or(window::Error::ZeroSpan)?;
        let span = period.get();
        let since_boot = context.counter("proc.uptime.since_boot", span, span, &[], clock.clone())?;
        let idle = context.counter("proc.uptime.idle", span, span, &[], clock.clone())?;

        Ok(Self {
            path: config.path.clone(),
            period,
            clock,
            since_boot,
            idle,
        })
    }

    async fn sample(&self) -> Result<(), Error> {
        let (since_boot, idle) = read(&self.path).await?;
        debug!(since_boot, idle, "sampled uptime");
        #[allow(clippy::cast_precision_loss)]
        {
            self.since_boot.set(since_boot as f64);
            self.idle.set(idle as f64);
        }
        Ok(())
    }

    /// Run [`Uptime`] until `stop` fires.
    ///
    /// # Errors
    ///
    /// Function will return an error if the uptime file cannot be read or
    /// parsed.
    pub async fn run(self, stop: Listener) -> Result<(), Error> {
        run_every_n_seconds(self.clock.clone(), self.period, stop, || self.sample()).await
    }
}

async fn read(path: &Path) -> Result<(u64, u64), Error> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse(&contents)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{Config, Error, Uptime, parse};
    use crate::{
        clock::ManualClock, format::Format, format::Tags, probe::Context, registry::Registry,
    };

    #[test]
    fn parse_truncates_both_fields() {
        assert_eq!(parse("12345.67 4321.99\n").unwrap(), (12_345, 4_321));
    }

    #[test]
    fn parse_rejects_short_input() {
        assert!(matches!(parse(""), Err(Error::Malformed(_))));
        assert!(matches!(parse("12.0\n"), Err(Error::Malformed(_))));
        assert!(matches!(parse("abc 1.0"), Err(Error::ParseFloat(_))));
    }

    #[tokio::test]
    async fn sample_sets_both_counters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "350735.47 234388.90").unwrap();

        let clock = ManualClock::at_secs(1_200);
        let registry = Registry::new();
        let context = Context::new(Format::Plain, Tags::new(), registry.clone());
        let config = Config {
            span_seconds: 60,
            path: file.path().to_path_buf(),
        };
        let probe = Uptime::new(&config, clock, &context).unwrap();

        probe.sample().await.unwrap();
        probe.sample().await.unwrap();
        assert_eq!(probe.since_boot.get_sum(), 350_735.0);
        assert_eq!(probe.idle.get_sum(), 234_388.0);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let clock = ManualClock::at_secs(0);
        let context = Context::default();
        let config = Config {
            span_seconds: 60,
            path: "/nonexistent/uptime".into(),
        };
        let probe = Uptime::new(&config, clock, &context).unwrap();
        assert!(matches!(probe.sample().await, Err(Error::Io { .. })));
    }
}
