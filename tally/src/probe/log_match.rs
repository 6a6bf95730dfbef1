//! The log-matching probe.
//!
//! Follows a file from its current end, in the manner of `tail -f`, and
//! increments a counter for every complete line matching a regular
//! expression. Lines are matched after lossy UTF-8 decoding. When the file
//! shrinks it is assumed to have been truncated and is read again from the
//! start.
//!
//! ## Counters
//!
//! `<metric>`: Lines matching `pattern`, named by the configuration

use std::{io::SeekFrom, path::PathBuf, sync::Arc, time::Duration};

use regex::Regex;
use serde::Deserialize;
use tally_signal::Listener;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncSeekExt, BufReader},
};
use tracing::{debug, info};

use super::Context;
use crate::{
    clock::Clock,
    counter::MetricCounter,
    window::Window,
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors produced by [`LogMatch`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pattern does not compile.
    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),
    /// Wrapper for [`std::io::Error`]
    #[error("[{context}] {path:?}: {source}")]
    Io {
        /// The context for the error, simple tag
        context: &'static str,
        /// The file being followed
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
}

/// Default span in seconds
#[must_use]
pub fn default_span_seconds() -> u64 {
    10
}

/// Default reporting interval in seconds
#[must_use]
pub fn default_interval_seconds() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`LogMatch`]
pub struct Config {
    /// The file to follow
    pub path: PathBuf,
    /// Regular expression a line must match to be counted
    pub pattern: String,
    /// Name of the counter
    pub metric: String,
    /// Window span in seconds
    #[serde(default = "default_span_seconds")]
    pub span_seconds: u64,
    /// Reporting interval in seconds, must divide the span
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), super::Error> {
        Window::new(self.span_seconds, self.interval_seconds)?;
        Regex::new(&self.pattern).map_err(Error::from)?;
        Ok(())
    }
}

#[derive(Debug)]
/// The log-matching probe.
pub struct LogMatch<C> {
    path: PathBuf,
    pattern: Regex,
    clock: C,
    counter: Arc<MetricCounter<C>>,
}

impl<C> LogMatch<C>
where
    C: Clock + Clone + 'static,
{
    /// Create a new [`LogMatch`] probe
    ///
    /// # Errors
    ///
    /// Function will return an error if the pattern does not compile or the
    /// window is invalid.
    pub fn new(config: &Config, clock: C, context: &Context) -> Result<Self, super::Error> {
        let pattern = Regex::new(&config.pattern).map_err(Error::from)?;
        let counter = context.counter(
            &config.metric,
            config.span_seconds,
            config.interval_seconds,
            &[],
            clock.clone(),
        )?;
        Ok(Self {
            path: config.path.clone(),
            pattern,
            clock,
            counter,
        })
    }

    fn observe(&self, line: &str) {
        if self.pattern.is_match(line) {
            self.counter.inc();
        }
    }

    fn io_error(&self, context: &'static str) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| Error::Io {
            context,
            path: self.path.clone(),
            source,
        }
    }

    /// Run [`LogMatch`] until `stop` fires.
    ///
    /// Stop is checked between lines and on every poll of a quiet file.
    ///
    /// # Errors
    ///
    /// Function will return an error if the file cannot be opened or read.
    pub async fn run(self, mut stop: Listener) -> Result<(), Error> {
        let file = File::open(&self.path)
            .await
            .map_err(self.io_error("open"))?;
        let mut reader = BufReader::new(file);
        let mut position = reader
            .seek(SeekFrom::End(0))
            .await
            .map_err(self.io_error("seek"))?;
        info!(path = %self.path.display(), position, "following file");

        let mut line = Vec::new();
        loop {
            // A dropped trigger also reads as a stop.
            if !matches!(stop.try_recv(), Ok(false)) {
                info!("stop signal received");
                return Ok(());
            }

            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(self.io_error("read"))?;
            position += read as u64;

            if read > 0 {
                // A line without its newline is still being written.
                if line.ends_with(b"\n") {
                    self.observe(&String::from_utf8_lossy(&line));
                    line.clear();
                }
                continue;
            }

            let len = reader
                .get_ref()
                .metadata()
                .await
                .map_err(self.io_error("metadata"))?
                .len();
            if len < position {
                debug!(len, position, "file truncated, reading from start");
                position = reader
                    .seek(SeekFrom::Start(0))
                    .await
                    .map_err(self.io_error("seek"))?;
                line.clear();
                continue;
            }
            self.clock.sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf, time::Duration};

    use super::{Config, LogMatch};
    use crate::{
        clock::{ManualClock, SystemClock},
        probe::{self, Context},
    };

    fn config(path: PathBuf) -> Config {
        Config {
            path,
            pattern: "authentication failure".to_string(),
            metric: "auth.failures".to_string(),
            span_seconds: 10,
            interval_seconds: 1,
        }
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let mut conf = config("/var/log/auth.log".into());
        conf.pattern = "(unclosed".to_string();
        assert!(matches!(
            conf.validate(),
            Err(probe::Error::LogMatch(super::Error::Regex(_)))
        ));
        assert!(LogMatch::new(&conf, ManualClock::at_secs(0), &Context::default()).is_err());
    }

    #[test]
    fn observe_counts_matching_lines() {
        let probe = LogMatch::new(
            &config("/var/log/auth.log".into()),
            ManualClock::at_secs(1_000),
            &Context::default(),
        )
        .unwrap();

        probe.observe("sshd: pam_unix: authentication failure; user=root\n");
        probe.observe("sshd: session opened for user root\n");
        probe.observe("su: authentication failure\n");
        assert_eq!(probe.counter.get_sum(), 2.0);
    }

    #[tokio::test]
    async fn follows_appended_lines_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "authentication failure before start").unwrap();

        let probe = LogMatch::new(
            &config(file.path().to_path_buf()),
            SystemClock,
            &Context::default(),
        )
        .unwrap();
        let counter = std::sync::Arc::clone(&probe.counter);
        let (listener, trigger) = tally_signal::stop();
        let handle = tokio::spawn(probe.run(listener));

        // Give the probe time to open the file and seek to its end.
        tokio::time::sleep(Duration::from_millis(250)).await;
        writeln!(file, "authentication failure one").unwrap();
        writeln!(file, "unrelated").unwrap();
        write!(file, "authentication fail").unwrap();
        file.flush().unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.get_sum() < 1.0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Completing the partial line makes it count.
        writeln!(file, "ure two").unwrap();
        file.flush().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.get_sum() < 2.0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        trigger.fire_and_wait().await;
        handle.await.unwrap().unwrap();
        assert_eq!(counter.get_sum(), 2.0);
    }

    #[tokio::test]
    async fn truncated_file_is_read_from_start() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for n in 0..10 {
            writeln!(file, "session opened for user {n} by (uid=0)").unwrap();
        }
        file.flush().unwrap();

        let probe = LogMatch::new(
            &config(file.path().to_path_buf()),
            SystemClock,
            &Context::default(),
        )
        .unwrap();
        let counter = std::sync::Arc::clone(&probe.counter);
        let (listener, trigger) = tally_signal::stop();
        let handle = tokio::spawn(probe.run(listener));
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Rotated in place: shorter than the offset already read.
        std::fs::write(file.path(), "authentication failure\n").unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.get_sum() < 1.0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        trigger.fire_and_wait().await;
        handle.await.unwrap().unwrap();
        assert_eq!(counter.get_sum(), 1.0);
    }
}
