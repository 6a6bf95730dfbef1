//! The process-state probe.
//!
//! ## Counters
//!
//! `proc.num_processes`: Processes seen in the process table, tagged with
//! `state`, one of `running`, `sleeping`, `disk_sleep`, `stopped`,
//! `tracing_stop`, `zombie`, `dead` or `unknown`
//!
//! The process table is walked once per second, so a span of `N` seconds
//! reports the sum of `N` one-second samples. Only supported on Linux.

use std::{num::NonZeroU64, sync::Arc};

use rustc_hash::FxHashMap;
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

const METRIC: &str = "proc.num_processes";
const UNKNOWN: &str = "unknown";
const STATES: [&str; 8] = [
    "running",
    "sleeping",
    "disk_sleep",
    "stopped",
    "tracing_stop",
    "zombie",
    "dead",
    UNKNOWN,
];

/// Errors produced by [`Processes`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(target_os = "linux")]
    /// Wrapper for [`procfs::ProcError`]
    #[error("Unable to read procfs: {0}")]
    Proc(#[from] procfs::ProcError),
    /// The process table cannot be read on this platform.
    #[error("process table probe is only supported on Linux")]
    Unsupported,
    /// The blocking walk of the process table panicked or was cancelled.
    #[error("process table walk failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Default span in seconds
#[must_use]
pub fn default_span_seconds() -> u64 {
    15
}

/// Default reporting interval in seconds
#[must_use]
pub fn default_interval_seconds() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Processes`]
pub struct Config {
    /// Window span in seconds
    #[serde(default = "default_span_seconds")]
    pub span_seconds: u64,
    /// Reporting interval in seconds, must divide the span
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            span_seconds: default_span_seconds(),
            interval_seconds: default_interval_seconds(),
        }
    }
}

impl Config {
    pub(crate) fn validate(self) -> Result<(), window::Error> {
        Window::new(self.span_seconds, self.interval_seconds).map(drop)
    }
}

/// Map a `/proc/<pid>/stat` state character to its tag value.
#[must_use]
pub(crate) fn state_name(state: char) -> &'static str {
    match state {
        'R' => "running",
        'S' => "sleeping",
        'D' => "disk_sleep",
        'T' => "stopped",
        't' => "tracing_stop",
        'Z' => "zombie",
        'X' | 'x' => "dead",
        _ => UNKNOWN,
    }
}

#[derive(Debug)]
/// The process-state probe.
pub struct Processes<C> {
    clock: C,
    counters: FxHashMap<&'static str, Arc<MetricCounter<C>>>,
}

impl<C> Processes<C>
where
    C: Clock + Clone + 'static,
{
    /// Create a new [`Processes`] probe with one counter per state.
    ///
    /// # Errors
    ///
    /// Function will return an error if the window is invalid or, off Linux,
    /// always.
    pub fn new(config: &Config, clock: C, context: &Context) -> Result<Self, super::Error> {
        if !cfg!(target_os = "linux") {
            return Err(Error::Unsupported.into());
        }
        let mut counters = FxHashMap::default();
        for state in STATES {
            let counter = context.counter(
                METRIC,
                config.span_seconds,
                config.interval_seconds,
                &[("state", state)],
                clock.clone(),
            )?;
            counters.insert(state, counter);
        }
        Ok(Self { clock, counters })
    }

    fn record<I>(&self, states: I)
    where
        I: IntoIterator<Item = char>,
    {
        let mut seen = 0_u64;
        for state in states {
            if let Some(counter) = self.counters.get(state_name(state)) {
                counter.inc();
            }
            seen += 1;
        }
        debug!(processes = seen, "walked process table");
    }

    async fn sample(&self) -> Result<(), Error> {
        // Walking /proc is blocking file I/O.
        let states = tokio::task::spawn_blocking(process_states).await??;
        self.record(states);
        Ok(())
    }

    /// Run [`Processes`] until `stop` fires.
    ///
    /// # Errors
    ///
    /// Function will return an error if the process table cannot be listed.
    pub async fn run(self, stop: Listener) -> Result<(), Error> {
        let every_second = NonZeroU64::MIN;
        run_every_n_seconds(self.clock.clone(), every_second, stop, || self.sample()).await
    }
}

/// The state of every process that could be read. Processes that exit during
/// the walk are skipped.
#[cfg(target_os = "linux")]
fn process_states() -> Result<Vec<char>, Error> {
    let states = procfs::process::all_processes()?
        .filter_map(Result::ok)
        .filter_map(|process| process.stat().ok())
        .map(|stat| stat.state)
        .collect();
    Ok(states)
}

#[cfg(not(target_os = "linux"))]
fn process_states() -> Result<Vec<char>, Error> {
    Err(Error::Unsupported)
}
