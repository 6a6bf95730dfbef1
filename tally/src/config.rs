//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.

use std::{
    io,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{
    format::{Format, Tags},
    probe,
};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The configuration names no probes.
    #[error("At least one probe must be configured")]
    NoProbes,
    /// A probe's configuration is invalid.
    #[error("Probe {index} is invalid: {source}")]
    Probe {
        /// Position of the probe in the `probes` list
        index: usize,
        /// Underlying probe error
        #[source]
        source: Box<probe::Error>,
    },
}

/// Main configuration struct for this program
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The line template used by every counter
    #[serde(default)]
    pub format: Format,
    /// Tags added to every counter
    #[serde(default)]
    pub tags: FxHashMap<String, String>,
    /// Append dumped lines to this file rather than standard output
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// The probes feeding counters
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub probes: Vec<probe::Config>,
}

impl Config {
    /// Read, parse and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its contents fail
    /// [`Config::parse`].
    pub fn from_path<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::parse(&contents)
    }

    /// Parse and validate a YAML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not deserialize or
    /// [`Config::validate`] fails.
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every probe's configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoProbes` if no probe is configured, `Error::Probe` for
    /// the first invalid one otherwise.
    pub fn validate(&self) -> Result<(), Error> {
        if self.probes.is_empty() {
            return Err(Error::NoProbes);
        }
        for (index, probe) in self.probes.iter().enumerate() {
            probe.validate().map_err(|source| Error::Probe {
                index,
                source: Box::new(source),
            })?;
        }
        Ok(())
    }

    /// The global tags as a [`Tags`] set.
    #[must_use]
    pub fn tags(&self) -> Tags {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}
