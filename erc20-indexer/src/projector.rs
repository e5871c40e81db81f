//! Applies decoded batches to the ledger.
//!
//! The projector is the only writer. For each batch it:
//! 1. Compares the stored checkpoint hash with the chain's block at that
//!    height. A mismatch is a reorg: the ledger is rolled back to the last
//!    common ancestor and the batch is discarded.
//! 2. Otherwise stages the batch against the committed ledger, which checks
//!    ordering, balances and supply conservation for the touched rows,
//!    writes the resulting [`Changeset`] to the store in one transaction,
//!    and only then absorbs it into the ledger readers see and pushes
//!    notifications.
//!
//! A failure anywhere before the absorb leaves the visible ledger and the
//! stored state exactly as they were. Full replay verification runs when
//! the ledger is loaded, not per batch.

use std::sync::Arc;

use alloy::primitives::B256;
use erc20_ledger::{Changeset, Checkpoint, Ledger, SharedLedger, Store, TransferEvent};

use crate::error::IndexerError;
use crate::fetcher::{ChainSource, Fetcher};
use crate::subscription::{Hub, Notification};

/// Decoded events of one fetched block range.
#[derive(Debug, Clone)]
pub struct DecodedBatch {
    /// First block of the range.
    pub from_block: u64,
    /// Last block of the range.
    pub to_block: u64,
    /// Hash of `to_block`, the next checkpoint hash.
    pub to_block_hash: B256,
    /// Decoded transfers, in any order.
    pub events: Vec<TransferEvent>,
}

/// Result of [`Projector::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The batch is durable and visible.
    Committed {
        /// Newly applied transfers.
        applied: usize,
        /// New checkpoint.
        checkpoint: Checkpoint,
    },
    /// The batch lies entirely below the checkpoint; nothing changed.
    AlreadyApplied,
    /// The chain no longer contains the checkpoint block. The ledger was
    /// rolled back and the batch discarded.
    ReorgDetected {
        /// Last common ancestor, the new checkpoint.
        ancestor: Checkpoint,
        /// Transfers removed and retracted.
        retracted: usize,
    },
}

/// Single writer of the ledger.
#[derive(Debug)]
pub struct Projector<S> {
    ledger: SharedLedger,
    store: S,
    hub: Arc<Hub>,
    deployment_block: u64,
}

impl<S: Store> Projector<S> {
    /// Load the committed state from `store`, or start empty at
    /// `deployment_block`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored snapshot cannot be read or fails
    /// replay verification.
    pub fn open(store: S, deployment_block: u64, hub: Arc<Hub>) -> Result<Self, IndexerError> {
        let ledger = match store.load()? {
            Some(snapshot) => Ledger::from_snapshot(snapshot)?,
            None => Ledger::new(Checkpoint::initial(deployment_block)),
        };
        let checkpoint = ledger.checkpoint();
        tracing::info!(
            block = checkpoint.block_number,
            hash = %checkpoint.block_hash,
            transfers = ledger.len(),
            holders = ledger.holder_count(),
            "ledger loaded"
        );

        Ok(Self {
            ledger: SharedLedger::new(ledger),
            store,
            hub,
            deployment_block,
        })
    }

    /// Handle for readers of the committed ledger.
    #[must_use]
    pub fn ledger(&self) -> SharedLedger {
        self.ledger.clone()
    }

    /// The committed checkpoint.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        self.ledger.snapshot().checkpoint()
    }

    /// Reconcile with the chain, then commit `batch` on top of `checkpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be queried, the batch violates
    /// ledger invariants, or the commit cannot be persisted.
    pub async fn apply<C: ChainSource>(
        &mut self,
        fetcher: &Fetcher<C>,
        batch: DecodedBatch,
        checkpoint: Checkpoint,
    ) -> Result<ApplyOutcome, IndexerError> {
        if let Some(ancestor) = self.find_fork(fetcher, checkpoint).await? {
            let retracted = self.rollback(ancestor)?;
            return Ok(ApplyOutcome::ReorgDetected {
                ancestor,
                retracted,
            });
        }
        self.commit(batch)
    }

    /// The last common ancestor if the chain no longer holds `checkpoint`.
    async fn find_fork<C: ChainSource>(
        &self,
        fetcher: &Fetcher<C>,
        checkpoint: Checkpoint,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        if checkpoint.is_sentinel() {
            return Ok(None);
        }
        let canonical = fetcher.block_ref(checkpoint.block_number).await?;
        if canonical.is_some_and(|b| b.hash == checkpoint.block_hash) {
            return Ok(None);
        }

        tracing::warn!(
            block = checkpoint.block_number,
            stored = %checkpoint.block_hash,
            chain = ?canonical.map(|b| b.hash),
            "reorg detected at checkpoint"
        );

        for (number, hash) in self.ledger.snapshot().fork_candidates() {
            let canonical = fetcher.block_ref(number).await?;
            if canonical.is_some_and(|b| b.hash == hash) {
                return Ok(Some(Checkpoint::now(number, hash)));
            }
        }
        Ok(Some(Checkpoint::initial(self.deployment_block)))
    }

    fn rollback(&mut self, ancestor: Checkpoint) -> Result<usize, IndexerError> {
        let current = self.ledger.snapshot();
        let from = current.checkpoint().block_number;
        let change = current.stage_rollback(ancestor)?;
        drop(current);

        let change = self.persist(change)?;
        let retracted = change.removed.len();
        self.hub
            .publish(change.removed.into_iter().map(Notification::Retracted));

        tracing::info!(
            from,
            to = ancestor.block_number,
            retracted,
            "rolled back to common ancestor"
        );
        Ok(retracted)
    }

    /// Commit a batch without consulting the chain.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::Gap`] when the batch starts past the next
    /// uncommitted block, a ledger error on invariant violations, or a
    /// storage error if persisting fails.
    pub fn commit(&mut self, batch: DecodedBatch) -> Result<ApplyOutcome, IndexerError> {
        let current = self.ledger.snapshot();
        let next_block = current.checkpoint().next_block();

        if batch.to_block < next_block {
            tracing::debug!(
                from_block = batch.from_block,
                to_block = batch.to_block,
                "batch already applied"
            );
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if batch.from_block > next_block {
            return Err(IndexerError::Gap {
                from_block: batch.from_block,
                next_block,
            });
        }

        let checkpoint = Checkpoint::now(batch.to_block, batch.to_block_hash);
        let change = current.stage(batch.events, checkpoint)?;
        let transfers = current.len() + change.inserted.len();
        drop(current);

        let change = self.persist(change)?;
        let count = change.inserted.len();
        self.hub
            .publish(change.inserted.into_iter().map(Notification::Transfer));

        tracing::info!(
            from_block = batch.from_block,
            to_block = batch.to_block,
            applied = count,
            transfers,
            "batch committed"
        );
        Ok(ApplyOutcome::Committed {
            applied: count,
            checkpoint,
        })
    }

    /// Write `change` durably, then make it visible to readers.
    fn persist(&self, change: Changeset) -> Result<Changeset, IndexerError> {
        self.store.commit(&change)?;
        self.ledger.update(|ledger| ledger.absorb(&change));
        Ok(change)
    }
}
