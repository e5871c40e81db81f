//! Snapshot handle shared between the single writer and many readers.
//!
//! Readers clone the current `Arc<Ledger>` and release the lock at once, so
//! every query runs against one committed state. The writer mutates under
//! the write lock through [`Arc::make_mut`]: in place when no reader holds
//! the old state, on a private copy otherwise.

use std::sync::{Arc, PoisonError, RwLock};

use crate::ledger::Ledger;

/// Cheaply clonable handle to the currently committed [`Ledger`].
#[derive(Debug, Clone)]
pub struct SharedLedger {
    current: Arc<RwLock<Arc<Ledger>>>,
}

impl SharedLedger {
    /// Publish `ledger` as the initial committed state.
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(ledger))),
        }
    }

    /// The committed ledger at the time of the call.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Ledger> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply `f` to the committed state. Readers see either the state
    /// before the call or after it.
    pub fn update<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut current))
    }
}
