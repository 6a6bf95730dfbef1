//! Probes for the `tally` binary
//!
//! A probe is a producer that feeds counters from some source on the host:
//! `/proc/uptime`, the process table or a log file. Each probe builds its
//! counters against a shared [`Context`] at construction, so that a
//! [`crate::dumper::PeriodicDumper`] built from the context's registry dumps
//! them, and then runs until its stop signal fires.

use std::sync::Arc;

use serde::Deserialize;
use tally_signal::Listener;

use crate::{
    clock::{Clock, SystemClock},
    counter::{self, MetricCounter},
    format::{Format, Tags},
    registry::Registry,
    sink::FileSink,
    window,
};

pub mod log_match;
pub mod processes;
pub mod uptime;

/// Errors produced by [`Probe`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid window geometry.
    #[error("Invalid window: {0}")]
    Window(#[from] window::Error),
    /// Counter construction failed.
    #[error("Counter error: {0}")]
    Counter(#[from] counter::Error),
    /// See [`crate::probe::uptime::Error`] for details.
    #[error("Uptime probe error: {0}")]
    Uptime(#[from] uptime::Error),
    /// See [`crate::probe::processes::Error`] for details.
    #[error("Processes probe error: {0}")]
    Processes(#[from] processes::Error),
    /// See [`crate::probe::log_match::Error`] for details.
    #[error("Log match probe error: {0}")]
    LogMatch(#[from] log_match::Error),
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Probe`]
pub enum Config {
    /// See [`crate::probe::uptime::Config`] for details.
    Uptime(uptime::Config),
    /// See [`crate::probe::processes::Config`] for details.
    Processes(processes::Config),
    /// See [`crate::probe::log_match::Config`] for details.
    LogMatch(log_match::Config),
}

impl Config {
    /// Check the configuration without building anything.
    ///
    /// # Errors
    ///
    /// Returns an error if a span/interval pair is not a legal window or a
    /// pattern does not compile.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Config::Uptime(conf) => conf.validate()?,
            Config::Processes(conf) => conf.validate()?,
            Config::LogMatch(conf) => conf.validate()?,
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
/// Settings shared by every probe's counters.
pub struct Context {
    format: Format,
    tags: Tags,
    registry: Registry,
    output: Option<FileSink>,
}

impl Context {
    /// Create a new [`Context`]. Counters built from it are registered in
    /// `registry` and write to standard output.
    #[must_use]
    pub fn new(format: Format, tags: Tags, registry: Registry) -> Self {
        Self {
            format,
            tags,
            registry,
            output: None,
        }
    }

    /// Send every counter's lines to `output` instead of standard output.
    #[must_use]
    pub fn with_output(self, output: FileSink) -> Self {
        Self {
            output: Some(output),
            ..self
        }
    }

    /// The registry counters are built against.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn counter<C>(
        &self,
        name: &str,
        span_secs: u64,
        interval_secs: u64,
        extra_tags: &[(&str, &str)],
        clock: C,
    ) -> Result<Arc<MetricCounter<C>>, counter::Error>
    where
        C: Clock + 'static,
    {
        let mut tags = self.tags.clone();
        for (key, value) in extra_tags {
            tags.insert(*key, *value);
        }
        let mut builder = MetricCounter::builder(name)
            .span_secs(span_secs)
            .interval_secs(interval_secs)
            .format(self.format)
            .tags(tags)
            .registry(&self.registry);
        if let Some(output) = &self.output {
            builder = builder.sink(output.clone());
        }
        builder.build(clock)
    }
}

#[derive(Debug)]
/// A running source of measurements.
///
/// All probes supported by tally are a variant of this enum. Please see
/// variant documentation for details.
pub enum Probe<C = SystemClock> {
    /// See [`crate::probe::uptime::Uptime`] for details.
    Uptime(uptime::Uptime<C>),
    /// See [`crate::probe::processes::Processes`] for details.
    Processes(processes::Processes<C>),
    /// See [`crate::probe::log_match::LogMatch`] for details.
    LogMatch(log_match::LogMatch<C>),
}

impl<C> Probe<C>
where
    C: Clock + Clone + 'static,
{
    /// Create a new [`Probe`], building its counters against `context`.
    ///
    /// # Errors
    ///
    /// Function will return an error if the configuration is invalid or, for
    /// probes unsupported on this platform, always.
    pub fn new(config: &Config, clock: C, context: &Context) -> Result<Self, Error> {
        let probe = match config {
            Config::Uptime(conf) => Self::Uptime(uptime::Uptime::new(conf, clock, context)?),
            Config::Processes(conf) => {
                Self::Processes(processes::Processes::new(conf, clock, context)?)
            }
            Config::LogMatch(conf) => Self::LogMatch(log_match::LogMatch::new(conf, clock, context)?),
        };
        Ok(probe)
    }

    /// Runs this [`Probe`] until `stop` fires.
    ///
    /// # Errors
    ///
    /// Function will return an error if the underlying probe cannot read its
    /// source.
    pub async fn run(self, stop: Listener) -> Result<(), Error> {
        match self {
            Probe::Uptime(inner) => inner.run(stop).await?,
            Probe::Processes(inner) => inner.run(stop).await?,
            Probe::LogMatch(inner) => inner.run(stop).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Context, Error, uptime};
    use crate::{format::Format, format::Tags, registry::Registry, window};

    #[test]
    fn context_counters_carry_shared_and_extra_tags() {
        let registry = Registry::new();
        let context = Context::new(
            Format::Plain,
            Tags::new().with("dc", "east"),
            registry.clone(),
        );
        let clock = crate::clock::ManualClock::at_secs(0);
        let counter = context
            .counter("proc.num_processes", 15, 1, &[("state", "zombie")], clock)
            .unwrap();

        assert_eq!(counter.tags().rendered(), "dc=east state=zombie");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn validate_rejects_bad_windows() {
        let config = Config::Uptime(uptime::Config {
            span_seconds: 0,
            path: uptime::default_path(),
        });
        assert!(matches!(
            config.validate(),
            Err(Error::Window(window::Error::ZeroSpan))
        ));
    }
}
