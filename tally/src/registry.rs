//! Explicit registry of live counters
//!
//! A [`Registry`] remembers the counters built against it so that a
//! [`crate::dumper::PeriodicDumper`] can be asked to dump "everything" without
//! the caller listing each counter. It holds weak references: dropping the
//! last handle to a counter removes it from the registry.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::dumper::Dump;

#[derive(Debug, Clone, Default)]
/// A shared, cloneable set of dumpable counters.
pub struct Registry {
    counters: Arc<Mutex<Vec<Weak<dyn Dump>>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `counter`.
    pub fn register(&self, counter: Arc<dyn Dump>) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counters.push(Arc::downgrade(&counter));
    }

    /// Every counter still alive, in registration order.
    #[must_use]
    pub fn counters(&self) -> Vec<Arc<dyn Dump>> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counters.retain(|counter| counter.strong_count() > 0);
        counters.iter().filter_map(Weak::upgrade).collect()
    }

    /// The number of live counters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters().len()
    }

    /// Whether no live counters are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
