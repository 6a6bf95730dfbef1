//! Periodic, span-aligned dumping of counters
//!
//! A [`PeriodicDumper`] owns a list of counters and, once started, a tokio
//! task that wakes on each counter's span boundary and calls its
//! [`Dump::dump`]. Boundaries are absolute: a counter with a 60 second span
//! dumps at every multiple of 60 seconds since the epoch, no matter when the
//! dumper was started.
//!
//! The dumper moves through three states. An idle [`PeriodicDumper`] is
//! started into a [`RunningDumper`]. [`RunningDumper::stop`] fires a stop
//! signal and waits: the task notices the signal at its next wake-up, performs
//! the dump that was already due, does not reschedule, and exits, handing the
//! idle `PeriodicDumper` back. Sleeps are never interrupted, so a stop takes
//! at most one span of the fastest counter.

use std::{future::Future, sync::Arc, time::Duration};

use tally_signal::Listener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    counter,
    registry::Registry,
};

/// Anything a [`PeriodicDumper`] can dump.
pub trait Dump: std::fmt::Debug + Send + Sync {
    /// Name used in log messages.
    fn name(&self) -> &str;

    /// Width of the window in seconds; dumps land on multiples of it.
    fn span_secs(&self) -> u64;

    /// Emit the current window.
    ///
    /// # Errors
    ///
    /// Implementations return an error if their output cannot be written.
    fn dump(&self) -> Result<(), counter::Error>;
}

/// Errors produced by [`PeriodicDumper`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The dumper was given no counters.
    #[error("no counters to dump")]
    NoCounters,
    /// The background task panicked or was cancelled.
    #[error("dumper task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The first multiple of `span` strictly after `now`.
#[inline]
pub(crate) fn next_boundary(now: u64, span: u64) -> u64 {
    now - now % span + span
}

#[derive(Debug)]
/// An idle dumper.
pub struct PeriodicDumper<C = SystemClock> {
    clock: C,
    counters: Vec<Arc<dyn Dump>>,
}

impl<C> PeriodicDumper<C>
where
    C: Clock + 'static,
{
    /// Create a dumper for `counters`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoCounters` if `counters` is empty.
    pub fn new(clock: C, counters: Vec<Arc<dyn Dump>>) -> Result<Self, Error> {
        if counters.is_empty() {
            return Err(Error::NoCounters);
        }
        Ok(Self { clock, counters })
    }

    /// Create a dumper for every live counter in `registry`.
    ///
    /// Counters registered after this call are not picked up.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoCounters` if the registry is empty.
    pub fn from_registry(clock: C, registry: &Registry) -> Result<Self, Error> {
        Self::new(clock, registry.counters())
    }

    /// The counters this dumper dumps.
    #[must_use]
    pub fn counters(&self) -> &[Arc<dyn Dump>] {
        &self.counters
    }

    /// Start dumping on a background task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(self) -> RunningDumper<C> {
        let (listener, trigger) = tally_signal::stop();
        // Scheduled here, not in the task, so a boundary crossed before the
        // task is first polled is still dumped.
        let now = self.clock.now_secs();
        let due = self
            .counters
            .iter()
            .map(|counter| next_boundary(now, counter.span_secs()))
            .collect();
        info!(counters = self.counters.len(), now, "starting periodic dumper");
        let handle = tokio::spawn(self.run(due, listener));
        RunningDumper { trigger, handle }
    }

    /// Dump periodically for as long as `work` runs, then stop.
    ///
    /// # Errors
    ///
    /// Returns `Error::Join` if the background task failed.
    pub async fn dump_during<F>(self, work: F) -> Result<(F::Output, Self), Error>
    where
        F: Future,
    {
        let running = self.start();
        let output = work.await;
        let dumper = running.stop().await?;
        Ok((output, dumper))
    }

    async fn run(self, mut due: Vec<u64>, mut stop: Listener) -> Self {
        let mut stopping = false;
        loop {
            let Some(next) = due.iter().copied().min() else {
                break;
            };
            let wait = Duration::from_secs(next).saturating_sub(self.clock.now());
            self.clock.sleep(wait).await;

            // A dropped trigger also reads as a stop.
            stopping = stopping || !matches!(stop.try_recv(), Ok(false));
            let now = self.clock.now_secs();

            let mut dumped = false;
            for (counter, at) in self.counters.iter().zip(due.iter_mut()) {
                if *at > now {
                    continue;
                }
                dumped = true;
                if !stopping {
                    *at = next_boundary(now, counter.span_secs());
                }
                match counter.dump() {
                    Ok(()) => {
                        debug!(counter = counter.name(), now, "dumped");
                        metrics::counter!("tally.dumps").increment(1);
                    }
                    Err(err) => {
                        warn!("failed to dump {name}: {err}", name = counter.name());
                        metrics::counter!("tally.dump_failures").increment(1);
                    }
                }
            }

            if !dumped {
                debug!(now, next, "woke before any counter was due");
                continue;
            }
            if stopping {
                info!("stop signal received, final dump complete");
                break;
            }
        }
        self
    }
}

#[derive(Debug)]
/// A dumper whose background task is running.
///
/// Dropping a `RunningDumper` without calling [`RunningDumper::stop`] lets
/// the task finish its next due dump and exit on its own.
pub struct RunningDumper<C = SystemClock> {
    trigger: tally_signal::Trigger,
    handle: JoinHandle<PeriodicDumper<C>>,
}

impl<C> RunningDumper<C> {
    /// Stop dumping and wait for the in-flight dump to complete.
    ///
    /// Returns the idle dumper, which may be started again.
    ///
    /// # Errors
    ///
    /// Returns `Error::Join` if the background task failed.
    pub async fn stop(self) -> Result<PeriodicDumper<C>, Error> {
        debug!("signaling periodic dumper to stop");
        self.trigger.fire_and_wait().await;
        Ok(self.handle.await?)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::{Dump, Error, PeriodicDumper, next_boundary};
    use crate::{
        clock::{Clock, ManualClock},
        counter::MetricCounter,
        rate::RateCounter,
        registry::Registry,
        sink::{MemorySink, Sink},
    };

    #[derive(Debug)]
    struct FullDisk;

    impl Sink for FullDisk {
        fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
            Err(io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A `ManualClock` that jumps back by `step_back` seconds once the next
    /// sleep resolves, as a stepped system clock would.
    #[derive(Debug, Clone)]
    struct SteppedClock {
        inner: ManualClock,
        step_back: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Clock for SteppedClock {
        fn now(&self) -> Duration {
            self.inner.now()
        }

        async fn sleep(&self, duration: Duration) {
            self.inner.sleep(duration).await;
            let back = self.step_back.swap(0, Ordering::SeqCst);
            if back > 0 {
                self.inner.set(self.inner.now() - Duration::from_secs(back));
            }
        }
    }

    async fn wait_for_lines(sink: &MemorySink, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.lines().len() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dumper did not produce the expected lines");
    }

    #[test]
    fn boundaries_are_multiples_of_span() {
        assert_eq!(next_boundary(1_003, 10), 1_010);
        assert_eq!(next_boundary(1_010, 10), 1_020);
        assert_eq!(next_boundary(59, 60), 60);
        assert_eq!(next_boundary(0, 1), 1);
    }

    #[test]
    fn empty_dumper_is_rejected() {
        let clock = ManualClock::at_secs(0);
        assert!(matches!(
            PeriodicDumper::new(clock.clone(), Vec::new()),
            Err(Error::NoCounters)
        ));
        assert!(matches!(
            PeriodicDumper::from_registry(clock, &Registry::new()),
            Err(Error::NoCounters)
        ));
    }

    #[tokio::test]
    async fn first_dump_lands_on_span_boundary() {
        let clock = ManualClock::at_secs(1_003);
        let sink = MemorySink::new();
        let counter = MetricCounter::builder("requests")
            .span_secs(10)
            .interval_secs(5)
            .sink(sink.clone())
            .build(clock.clone())
            .unwrap();
        counter.add(2.0);

        let dumper = PeriodicDumper::new(clock.clone(), vec![counter as Arc<dyn Dump>]).unwrap();
        let running = dumper.start();

        let stop = running.stop();
        tokio::pin!(stop);
        assert!(futures::poll!(&mut stop).is_pending());

        clock.advance_secs(7);
        let dumper = stop.await.unwrap();

        assert_eq!(sink.lines(), vec!["requests 1000 2", "requests 1005 0"]);
        assert_eq!(dumper.counters().len(), 1);
    }

    #[tokio::test]
    async fn boundary_crossed_before_first_poll_is_dumped() {
        let clock = ManualClock::at_secs(1_003);
        let sink = MemorySink::new();
        let counter = MetricCounter::builder("c")
            .span_secs(10)
            .interval_secs(10)
            .sink(sink.clone())
            .build(clock.clone())
            .unwrap();
        counter.add(1.0);

        let running = PeriodicDumper::new(clock.clone(), vec![counter as Arc<dyn Dump>])
            .unwrap()
            .start();
        // The task has not run yet.
        clock.advance_secs(7); // 1010
        wait_for_lines(&sink, 1).await;
        assert_eq!(sink.lines(), vec!["c 1000 1"]);

        let stop = running.stop();
        tokio::pin!(stop);
        assert!(futures::poll!(&mut stop).is_pending());
        clock.advance_secs(10); // 1020
        stop.await.unwrap();
        assert_eq!(sink.lines(), vec!["c 1000 1", "c 1010 0"]);
    }

    #[tokio::test]
    async fn failing_sink_does_not_stop_the_others() {
        let clock = ManualClock::at_secs(1_000);
        let good_sink = MemorySink::new();
        let good = MetricCounter::builder("good")
            .span_secs(5)
            .interval_secs(5)
            .sink(good_sink.clone())
            .build(clock.clone())
            .unwrap();
        let bad = MetricCounter::builder("bad")
            .span_secs(5)
            .interval_secs(5)
            .sink(FullDisk)
            .build(clock.clone())
            .unwrap();

        let running = PeriodicDumper::new(
            clock.clone(),
            vec![bad as Arc<dyn Dump>, good as Arc<dyn Dump>],
        )
        .unwrap()
        .start();

        clock.advance_secs(5); // 1005
        wait_for_lines(&good_sink, 1).await;
        clock.advance_secs(5); // 1010
        wait_for_lines(&good_sink, 2).await;

        let stop = running.stop();
        tokio::pin!(stop);
        assert!(futures::poll!(&mut stop).is_pending());
        clock.advance_secs(5); // 1015
        stop.await.unwrap();
        assert_eq!(
            good_sink.lines(),
            vec!["good 1000 0", "good 1005 0", "good 1010 0"]
        );
    }

    #[tokio::test]
    async fn stop_during_early_wake_still_dumps() {
        let clock = ManualClock::at_secs(1_003);
        let stepped = SteppedClock {
            inner: clock.clone(),
            step_back: Arc::new(AtomicU64::new(0)),
        };
        let sink = MemorySink::new();
        let counter = MetricCounter::builder("requests")
            .span_secs(10)
            .interval_secs(10)
            .sink(sink.clone())
            .build(clock.clone())
            .unwrap();
        counter.add(1.0);

        let running = PeriodicDumper::new(stepped.clone(), vec![counter as Arc<dyn Dump>])
            .unwrap()
            .start();
        stepped.step_back.store(5, Ordering::SeqCst);

        let stop = running.stop();
        tokio::pin!(stop);
        assert!(futures::poll!(&mut stop).is_pending());

        // Wakes at 1010 but reads 1005: nothing is due yet.
        clock.advance_secs(7);
        while clock.now_secs() != 1_005 {
            assert!(futures::poll!(&mut stop).is_pending());
            tokio::task::yield_now().await;
        }
        assert!(futures::poll!(&mut stop).is_pending());
        assert!(sink.lines().is_empty());

        clock.advance_secs(5); // 1010
        stop.await.unwrap();
        assert_eq!(sink.lines(), vec!["requests 1000 1"]);
    }

    #[tokio::test]
    async fn dumps_every_span_until_stopped() {
        let clock = ManualClock::at_secs(1_003);
        let sink = MemorySink::new();
        let counter = MetricCounter::builder("hits")
            .span_secs(5)
            .interval_secs(5)
            .sink(sink.clone())
            .build(clock.clone())
            .unwrap();
        counter.inc();

        let dumper =
            PeriodicDumper::new(clock.clone(), vec![Arc::clone(&counter) as Arc<dyn Dump>])
                .unwrap();
        let running = dumper.start();

        clock.advance_secs(2); // 1005
        wait_for_lines(&sink, 1).await;

        clock.advance_secs(2); // 1007
        counter.add(4.0);
        clock.advance_secs(3); // 1010
        wait_for_lines(&sink, 2).await;

        let stop = running.stop();
        tokio::pin!(stop);
        assert!(futures::poll!(&mut stop).is_pending());
        clock.advance_secs(5); // 1015
        stop.await.unwrap();

        // The final dump happens, no later one is scheduled.
        clock.advance_secs(5);
        tokio::task::yield_now().await;
        assert_eq!(sink.lines(), vec!["hits 1000 1", "hits 1005 4", "hits 1010 0"]);
    }

    #[tokio::test]
    async fn counters_with_different_spans_keep_their_own_cadence() {
        let clock = ManualClock::at_secs(1_001);
        let fast_sink = MemorySink::new();
        let slow_sink = MemorySink::new();
        let fast = MetricCounter::builder("fast")
            .span_secs(2)
            .sink(fast_sink.clone())
            .build(clock.clone())
            .unwrap();
        let slow = Arc::new(
            RateCounter::new("slow", 4, 4, clock.clone())
                .unwrap()
                .with_sink(slow_sink.clone()),
        );

        let dumper = PeriodicDumper::new(
            clock.clone(),
            vec![fast as Arc<dyn Dump>, slow as Arc<dyn Dump>],
        )
        .unwrap();
        let running = dumper.start();

        clock.advance_secs(1); // 1002: fast only
        wait_for_lines(&fast_sink, 2).await;
        assert!(slow_sink.lines().is_empty());

        clock.advance_secs(2); // 1004: both
        wait_for_lines(&fast_sink, 4).await;
        wait_for_lines(&slow_sink, 1).await;

        let stop = running.stop();
        tokio::pin!(stop);
        assert!(futures::poll!(&mut stop).is_pending());
        clock.advance_secs(2); // 1006: fast only, final
        stop.await.unwrap();

        assert_eq!(fast_sink.lines().len(), 6);
        assert_eq!(slow_sink.lines(), vec!["slow 1000 0"]);
    }

    #[tokio::test]
    async fn dump_during_wraps_work() {
        let clock = ManualClock::at_secs(1_003);
        let registry = Registry::new();
        let sink = MemorySink::new();
        let counter = MetricCounter::builder("auth.failures")
            .span_secs(10)
            .interval_secs(10)
            .sink(sink.clone())
            .registry(&registry)
            .build(clock.clone())
            .unwrap();

        let dumper = PeriodicDumper::from_registry(clock.clone(), &registry).unwrap();
        let work_clock = clock.clone();
        let (failures, dumper) = dumper
            .dump_during(async move {
                counter.inc();
                counter.inc();
                work_clock.advance_secs(7);
                counter.get_sum()
            })
            .await
            .unwrap();

        assert_eq!(failures, 2.0);
        assert_eq!(sink.lines(), vec!["auth.failures 1000 2"]);
        assert_eq!(dumper.counters().len(), 1);
    }
}
