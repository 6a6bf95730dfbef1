//! Output line templates
//!
//! Every dumped sample becomes one text line. [`Format`] selects the template
//! and decides what happens to the implicit `host` tag; [`Tags`] is the
//! rendered `k=v` tag string.

use std::{collections::BTreeMap, fmt::Write};

use serde::Deserialize;

/// The line template used when dumping a counter.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// `<name> <timestamp> <value>[ <tags>]`, no implicit host tag.
    #[default]
    Plain,
    /// `<name> <timestamp> <value>[ <tags>]` for a tcollector parent, which
    /// adds the host tag itself. A supplied `host` tag is dropped.
    Tcollector,
    /// `put <name> <timestamp> <value>[ <tags>]` for opentsdb's telnet
    /// interface. The local hostname is added as `host` unless supplied.
    Opentsdb,
}

impl Format {
    /// Resolve the tags a counter will carry under this format.
    ///
    /// `hostname` is only consulted by [`Format::Opentsdb`].
    #[must_use]
    pub fn resolve_tags<F>(self, mut tags: Tags, hostname: F) -> Tags
    where
        F: FnOnce() -> Option<String>,
    {
        match self {
            Format::Plain => {}
            Format::Tcollector => {
                tags.remove("host");
            }
            Format::Opentsdb => {
                if !tags.inner.contains_key("host") {
                    if let Some(host) = hostname() {
                        tags.insert("host", host);
                    }
                }
            }
        }
        tags
    }

    /// Render one line, newline included.
    #[must_use]
    pub fn line(self, name: &str, timestamp: u64, value: f64, tags: &Tags) -> String {
        let mut line = String::new();
        if self == Format::Opentsdb {
            line.push_str("put ");
        }
        // Adding zero folds -0.0 into 0.0. Integral values print without a
        // fractional part.
        let value = value + 0.0;
        // Writing into a String cannot fail.
        let _ = write!(line, "{name} {timestamp} {value}");
        if !tags.is_empty() {
            line.push(' ');
            line.push_str(tags.rendered());
        }
        line.push('\n');
        line
    }
}

/// A set of `key=value` tags, rendered sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    inner: BTreeMap<String, String>,
    rendered: String,
}

impl Tags {
    /// An empty tag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tag.
    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.inner.insert(key.into(), value.into());
        self.render();
    }

    /// Remove a tag, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let value = self.inner.remove(key);
        self.render();
        value
    }

    /// Builder form of [`Tags::insert`].
    #[must_use]
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.insert(key, value);
        self
    }

    /// Look up a tag value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    /// Whether there are no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The `k=v k=v` tag string.
    #[must_use]
    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    fn render(&mut self) {
        self.rendered.clear();
        for (k, v) in &self.inner {
            if !self.rendered.is_empty() {
                self.rendered.push(' ');
            }
            self.rendered.push_str(k);
            self.rendered.push('=');
            self.rendered.push_str(v);
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Tags
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for (k, v) in iter {
            tags.inner.insert(k.into(), v.into());
        }
        tags.render();
        tags
    }
}

/// The local hostname, if it can be determined.
#[must_use]
pub fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}
