//! Drift-correcting periodic execution
//!
//! A [`Ticker`] runs an action on an ideal schedule `start, start + interval,
//! start + 2 * interval, ...`. When an action overruns the interval the ticks
//! it overran are skipped, not queued: the next run lands on the first
//! scheduled instant that is not already in the past. The long-run call rate
//! therefore matches the interval even when individual runs are slow.

use std::{future::Future, num::NonZeroU64, time::Duration};

use tally_signal::Listener;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

/// Errors produced by [`Ticker`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The tick interval is zero.
    #[error("ticker interval must be non-zero")]
    ZeroInterval,
}

#[derive(Debug)]
/// Periodic runner with a fixed ideal schedule.
pub struct Ticker<C = SystemClock> {
    clock: C,
    interval: Duration,
    /// The scheduled instant of the run in progress, then of the next run.
    next: Duration,
}

impl<C> Ticker<C>
where
    C: Clock,
{
    /// Create a `Ticker` whose schedule starts now.
    ///
    /// # Errors
    ///
    /// Returns `Error::ZeroInterval` if `interval` is zero.
    pub fn new(clock: C, interval: Duration) -> Result<Self, Error> {
        if interval.is_zero() {
            return Err(Error::ZeroInterval);
        }
        let next = clock.now();
        Ok(Self {
            clock,
            interval,
            next,
        })
    }

    /// Move the schedule to the first instant after the current one that is
    /// not before `now`, returning how many instants were skipped.
    fn fast_forward(&mut self, now: Duration) -> u64 {
        self.next += self.interval;
        let mut skipped = 0;
        while self.next < now {
            self.next += self.interval;
            skipped += 1;
        }
        skipped
    }

    /// Run `action` on schedule until it fails or `stop` fires.
    ///
    /// The first run happens immediately. The stop signal is observed while
    /// waiting between runs, never during one.
    ///
    /// # Errors
    ///
    /// The first error returned by `action` ends the loop and is returned.
    pub async fn run<F, Fut, E>(mut self, stop: Listener, mut action: F) -> Result<(), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let stop_wait = stop.recv();
        tokio::pin!(stop_wait);

        loop {
            action().await?;

            let now = self.clock.now();
            let skipped = self.fast_forward(now);
            if skipped > 0 {
                debug!(skipped, "action overran its interval, skipping ticks");
                metrics::counter!("tally.ticks_skipped").increment(skipped);
            }

            tokio::select! {
                biased;

                () = &mut stop_wait => {
                    info!("stop signal received");
                    return Ok(());
                }
                () = self.clock.sleep(self.next.saturating_sub(now)) => {}
            }
        }
    }
}

/// Run `action` every `interval_secs` seconds until it fails or `stop`
/// fires. See [`Ticker::run`].
///
/// # Errors
///
/// The first error returned by `action` ends the loop and is returned.
pub async fn run_every_n_seconds<C, F, Fut, E>(
    clock: C,
    interval_secs: NonZeroU64,
    stop: Listener,
    action: F,
) -> Result<(), E>
where
    C: Clock,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let next = clock.now();
    let ticker = Ticker {
        clock,
        interval: Duration::from_secs(interval_secs.get()),
        next,
    };
    ticker.run(stop, action).await
}
