//! One-shot stop signal for tally's background tasks.
//!
//! A periodic dumper, a ticker or a probe runs on its own tokio task and must
//! be told to stop from somewhere else. The mechanism here has two halves, a
//! [`Trigger`] and a [`Listener`]. The `Trigger` fires exactly once. Every
//! registered `Listener` acknowledges the stop either by observing it through
//! [`Listener::recv`] / [`Listener::try_recv`] or by being dropped, and
//! [`Trigger::fire_and_wait`] only returns once all registered listeners have
//! acknowledged.
//!
//! A dropped `Trigger` counts as fired. Tasks never outlive the code that
//! could have stopped them.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::debug;

/// Construct a [`Listener`] and [`Trigger`] pair.
///
/// The returned `Listener` is registered: `fire_and_wait` waits on it.
#[must_use]
pub fn stop() -> (Listener, Trigger) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let listener = Listener {
        receiver,
        peers: Arc::clone(&peers),
        notify: Arc::clone(&notify),
        received: false,
        acknowledged: false,
        registered: true,
    };
    let trigger = Trigger {
        sender,
        peers,
        notify,
    };

    (listener, trigger)
}

#[derive(Debug)]
/// The firing half of a stop signal.
pub struct Trigger {
    sender: watch::Sender<bool>,
    /// Registered listeners that have not yet acknowledged.
    peers: Arc<AtomicU32>,
    /// Poked by each listener as it acknowledges.
    notify: Arc<Notify>,
}

impl Trigger {
    /// Fire the signal. Does not wait for listeners.
    pub fn fire(self) {
        self.sender.send_replace(true);
    }

    /// Fire the signal and wait until every registered [`Listener`] has
    /// acknowledged it.
    pub async fn fire_and_wait(self) {
        let Self {
            sender,
            peers,
            notify,
        } = self;
        sender.send_replace(true);
        drop(sender);

        // Register interest before loading the peer count, else an
        // acknowledgment landing between the load and the await is lost.
        loop {
            let notified = notify.notified();
            let remaining = peers.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            debug!("waiting on {remaining} listeners to acknowledge stop");
            notified.await;
        }
    }
}

/// Errors for [`Listener::try_recv`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// The stop signal was already received by this listener.
    #[error("stop signal already received")]
    SignalReceived,
}

/// Errors for [`Listener::register`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The stop signal was already received by this listener.
    #[error("stop signal already received")]
    SignalReceived,
}

#[derive(Debug)]
/// The observing half of a stop signal.
///
/// Cloning produces an *unregistered* listener: it observes the signal but
/// [`Trigger::fire_and_wait`] does not wait for it. Use
/// [`Listener::register`] for a listener the trigger must wait on.
pub struct Listener {
    receiver: watch::Receiver<bool>,
    peers: Arc<AtomicU32>,
    notify: Arc<Notify>,
    received: bool,
    acknowledged: bool,
    registered: bool,
}

impl Listener {
    fn fired(&self) -> bool {
        // A closed channel means the trigger was dropped, which is a stop.
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    fn acknowledge(&mut self) {
        if !self.registered || self.acknowledged {
            return;
        }
        // fetch_sub would wrap at zero.
        let mut current = self.peers.load(Ordering::Relaxed);
        while current > 0 {
            match self.peers.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        self.acknowledged = true;
    }

    /// Wait for the stop signal.
    ///
    /// Returns immediately if the signal was already received.
    pub async fn recv(mut self) {
        if self.received {
            // Yield so a `select!` arm on a received listener does not
            // starve its siblings.
            tokio::task::yield_now().await;
            return;
        }
        // An error here is a dropped trigger: also a stop.
        let _ = self.receiver.wait_for(|fired| *fired).await;
        self.received = true;
        self.acknowledge();
    }

    /// Check for the stop signal without blocking.
    ///
    /// Returns `Ok(false)` while the signal is pending and `Ok(true)` the
    /// first time it is observed, acknowledging it.
    ///
    /// # Errors
    ///
    /// Every call after the one that returned `Ok(true)` returns
    /// `TryRecvError::SignalReceived`.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.received {
            return Err(TryRecvError::SignalReceived);
        }
        if self.fired() {
            self.received = true;
            self.acknowledge();
            return Ok(true);
        }
        Ok(false)
    }

    /// Register a new listener that the [`Trigger`] will wait on.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if this listener has already
    /// received the signal.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.received {
            return Err(RegisterError::SignalReceived);
        }
        self.peers.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            received: false,
            acknowledged: false,
            registered: true,
        })
    }
}

impl Clone for Listener {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            received: self.received,
            acknowledged: false,
            registered: false,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.acknowledge();
    }
}
