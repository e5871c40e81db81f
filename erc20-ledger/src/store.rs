//! Durable ledger state.
//!
//! A [`Snapshot`] is the whole persisted state: checkpoint, transfer
//! history, balances and supply totals. It is read once at startup.
//! Every later write is a [`Changeset`]: the events a batch inserts or a
//! rollback removes, the rows it touches, and the new checkpoint. A store
//! applies a changeset as one unit, so a crash can never leave balances
//! and checkpoint out of step.
//!
//! [`crate::SqliteStore`] is the durable backend. [`MemoryStore`] keeps a
//! snapshot in RAM for tests and dry runs.

use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::types::TransferEvent;

/// Persisted form of a [`crate::Ledger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Singleton progress record.
    pub checkpoint: Checkpoint,
    /// History in ascending `(block_number, log_index)` order.
    pub transfers: Vec<TransferEvent>,
    /// Non-zero balances, sorted by address.
    pub balances: Vec<BalanceRow>,
    /// Total value sent from the zero address.
    pub minted: U256,
    /// Total value sent to the zero address.
    pub burned: U256,
    /// Recently committed checkpoints, oldest first.
    #[serde(default)]
    pub anchors: Vec<Anchor>,
}

/// One row of the balance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRow {
    /// Holder address.
    pub address: Address,
    /// Balance in base units.
    pub balance: U256,
}

/// A remembered `(block_number, block_hash)` of a past checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Block height.
    pub block_number: u64,
    /// Block hash observed when the checkpoint was committed.
    pub block_hash: B256,
}

/// One atomic write: a committed batch or a rollback.
///
/// Produced by [`crate::Ledger::stage`] or [`crate::Ledger::stage_rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    /// Checkpoint after the write.
    pub checkpoint: Checkpoint,
    /// Events added, in ascending position order.
    pub inserted: Vec<TransferEvent>,
    /// Events removed, newest first.
    pub removed: Vec<TransferEvent>,
    /// Final balance of every touched address, sorted by address. A zero
    /// balance deletes the row.
    pub balances: Vec<BalanceRow>,
    /// Total minted after the write.
    pub minted: U256,
    /// Total burned after the write.
    pub burned: U256,
    /// The full anchor window after the write, oldest first.
    pub anchors: Vec<Anchor>,
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The database rejected a statement.
    #[error("{context}: {source}")]
    Sqlite {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A stored value cannot be parsed back.
    #[error("corrupt stored state: {0}")]
    Corrupt(String),

    /// The backend refused the write.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Transactional ledger persistence.
pub trait Store: Send + Sync {
    /// Load the last committed state, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if stored state exists but cannot be read.
    fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Apply `change` to the stored state. Either the whole change becomes
    /// durable or the stored state is left as it was.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the write fails; the previous state is
    /// then still the stored state.
    fn commit(&self, change: &Changeset) -> Result<(), StoreError>;
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        (**self).load()
    }

    fn commit(&self, change: &Changeset) -> Result<(), StoreError> {
        (**self).commit(change)
    }
}

/// In-memory store. All data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn commit(&self, change: &Changeset) -> Result<(), StoreError> {
        let mut slot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = slot.clone().unwrap_or_else(|| Snapshot {
            checkpoint: change.checkpoint,
            transfers: Vec::new(),
            balances: Vec::new(),
            minted: U256::ZERO,
            burned: U256::ZERO,
            anchors: Vec::new(),
        });

        next.transfers.retain(|e| !change.removed.contains(e));
        next.transfers.extend(change.inserted.iter().cloned());
        next.transfers.sort_by_key(TransferEvent::position);

        for row in &change.balances {
            match next.balances.binary_search_by_key(&row.address, |r| r.address) {
                Ok(i) if row.balance.is_zero() => {
                    next.balances.remove(i);
                }
                Ok(i) => {
                    if let Some(slot) = next.balances.get_mut(i) {
                        *slot = *row;
                    }
                }
                Err(_) if row.balance.is_zero() => {}
                Err(i) => next.balances.insert(i, *row),
            }
        }

        next.checkpoint = change.checkpoint;
        next.minted = change.minted;
        next.burned = change.burned;
        next.anchors.clone_from(&change.anchors);
        *slot = Some(next);
        Ok(())
    }
}
