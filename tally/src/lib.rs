//! The tally library
//!
//! Rolling, time-windowed counters and the machinery that dumps them. A
//! [`counter::MetricCounter`] or [`rate::RateCounter`] keeps one cell per
//! second over a fixed span, evicting stale seconds lazily whenever it is
//! touched. A [`dumper::PeriodicDumper`] wakes on each counter's span
//! boundary and writes the completed window out as text lines, one per
//! reporting interval. [`ticker`] runs producer code on a drift-correcting
//! schedule. All time flows through an injected [`clock::Clock`].
//!
//! The `tally` binary wires these together with a YAML configuration, see
//! [`config`] and [`probe`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub mod clock;
pub mod config;
pub mod counter;
pub mod dumper;
pub mod format;
pub mod probe;
pub mod rate;
pub mod registry;
pub mod sink;
pub mod ticker;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::MetricCounter;
pub use dumper::{Dump, PeriodicDumper, RunningDumper};
pub use rate::RateCounter;
pub use registry::Registry;
pub use ticker::{Ticker, run_every_n_seconds};
