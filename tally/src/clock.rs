//! The time source for every counter, dumper and ticker.
//!
//! Nothing in this crate reads the wall clock or sleeps directly. A [`Clock`]
//! is handed to each component at construction, which is what makes the
//! window arithmetic and the schedulers testable: [`ManualClock`] only moves
//! when told to.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tokio::sync::Notify;

#[async_trait]
/// The `Clock` used by every time-dependent component
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time elapsed since the UNIX epoch.
    fn now(&self) -> Duration;

    /// Whole seconds elapsed since the UNIX epoch.
    fn now_secs(&self) -> u64 {
        self.now().as_secs()
    }

    /// Wait for `duration` to pass on this clock.
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
/// A clock that operates with respect to real wall-clock time.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // A system clock set before 1970 reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
struct Inner {
    millis: AtomicU64,
    advanced: Notify,
}

#[derive(Debug, Clone)]
/// A clock that only moves when advanced.
///
/// Clones share the same time. [`Clock::sleep`] on a `ManualClock` resolves
/// once some other party has advanced the clock past the deadline; a zero
/// length sleep returns immediately. Millisecond resolution.
pub struct ManualClock {
    inner: Arc<Inner>,
}

impl ManualClock {
    /// Create a `ManualClock` reading `start` since the epoch.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(start: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                millis: AtomicU64::new(start.as_millis() as u64),
                advanced: Notify::new(),
            }),
        }
    }

    /// Create a `ManualClock` reading `secs` whole seconds since the epoch.
    #[must_use]
    pub fn at_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Move the clock forward by `by`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.inner
            .millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        self.inner.advanced.notify_waiters();
    }

    /// Move the clock forward by `secs` whole seconds.
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// Set the clock to `to` since the epoch. Time may move backward.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set(&self, to: Duration) {
        self.inner
            .millis
            .store(to.as_millis() as u64, Ordering::SeqCst);
        self.inner.advanced.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.inner.millis.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        loop {
            let advanced = self.inner.advanced.notified();
            if self.now() >= deadline {
                return;
            }
            advanced.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Clock, ManualClock};

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::at_secs(100);
        let other = clock.clone();

        clock.advance(Duration::from_millis(1_500));
        assert_eq!(other.now(), Duration::from_millis(101_500));
        assert_eq!(other.now_secs(), 101);

        other.set(Duration::from_secs(50));
        assert_eq!(clock.now_secs(), 50);
    }

    #[tokio::test]
    async fn manual_sleep_resolves_after_advance() {
        let clock = ManualClock::at_secs(10);
        let sleeper = clock.clone();
        let handle = tokio::spawn(async move {
            sleeper.sleep(Duration::from_secs(5)).await;
            sleeper.now_secs()
        });

        tokio::task::yield_now().await;
        clock.advance_secs(3);
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        clock.advance_secs(2);
        assert_eq!(handle.await.unwrap(), 15);
    }

    #[tokio::test]
    async fn manual_zero_sleep_is_immediate() {
        let clock = ManualClock::at_secs(10);
        clock.sleep(Duration::ZERO).await;
        assert_eq!(clock.now_secs(), 10);
    }
}
