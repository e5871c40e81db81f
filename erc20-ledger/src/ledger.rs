//! The balance projection over the committed transfer history.
//!
//! [`Ledger`] folds [`TransferEvent`]s in `(block_number, log_index)` order
//! into per-address balances and keeps the history those balances were
//! derived from, so both invariants can be re-checked at any time:
//!
//! - replaying the history from scratch yields the same balances;
//! - the sum of all balances equals `minted - burned`.
//!
//! The zero address is the mint/burn sentinel and never holds a balance.
//!
//! Writes happen in two steps. [`Ledger::stage`] and
//! [`Ledger::stage_rollback`] validate a change against the committed state
//! without touching it and describe the result as a [`Changeset`]: the
//! inserted or removed events, the final balance of every touched address,
//! the new totals and checkpoint. [`Ledger::absorb`] then applies a
//! changeset that has already been persisted. Both steps cost time
//! proportional to the change, not to the history.

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::{Address, B256, U256};
use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::store::{Anchor, BalanceRow, Changeset, Snapshot};
use crate::types::{Holder, Order, Position, TransferEvent};

/// Number of committed checkpoints remembered as fork-point candidates.
const ANCHOR_WINDOW: usize = 128;

/// Violations of ledger ordering or balance invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// A debit would make a balance negative.
    #[error("debit of {value} from {address} exceeds its balance {balance}")]
    InsufficientBalance {
        /// Debited address.
        address: Address,
        /// Balance before the debit.
        balance: U256,
        /// Attempted debit.
        value: U256,
    },

    /// A running total exceeded 256 bits.
    #[error("balance overflow at block {block_number} log {log_index}")]
    Overflow {
        /// Block of the offending event.
        block_number: u64,
        /// Log index of the offending event.
        log_index: u64,
    },

    /// An event belongs to a block the ledger has already moved past.
    #[error("event at block {block_number} log {log_index} precedes next block {next_block}")]
    OutOfOrder {
        /// Block of the offending event.
        block_number: u64,
        /// Log index of the offending event.
        log_index: u64,
        /// First block the ledger still accepts.
        next_block: u64,
    },

    /// A different event already occupies the same position.
    #[error("conflicting events at block {block_number} log {log_index}")]
    Conflict {
        /// Block of the offending event.
        block_number: u64,
        /// Log index of the offending event.
        log_index: u64,
    },

    /// An event lies beyond the checkpoint committed with it.
    #[error("event at block {block_number} lies beyond checkpoint {checkpoint}")]
    BeyondCheckpoint {
        /// Block of the offending event.
        block_number: u64,
        /// Block of the new checkpoint.
        checkpoint: u64,
    },

    /// The new checkpoint is lower than the current one.
    #[error("checkpoint cannot move back from {from} to {to}")]
    CheckpointRegression {
        /// Current checkpoint block.
        from: u64,
        /// Requested checkpoint block.
        to: u64,
    },

    /// Replaying the history disagrees with the incremental projection.
    #[error("replayed balance of {0} disagrees with the projection")]
    Diverged(Address),

    /// Σ balances ≠ minted − burned.
    #[error("sum of balances {balances} does not match supply {supply}")]
    SupplyMismatch {
        /// Sum of all holder balances.
        balances: U256,
        /// `minted - burned`.
        supply: U256,
    },
}

/// Committed transfer history and its balance projection.
#[derive(Debug, Clone)]
pub struct Ledger {
    checkpoint: Checkpoint,
    transfers: BTreeMap<Position, TransferEvent>,
    balances: HashMap<Address, U256>,
    minted: U256,
    burned: U256,
    anchors: BTreeMap<u64, B256>,
}

impl Ledger {
    /// An empty ledger positioned at `checkpoint`.
    #[must_use]
    pub fn new(checkpoint: Checkpoint) -> Self {
        let mut anchors = BTreeMap::new();
        if !checkpoint.is_sentinel() {
            anchors.insert(checkpoint.block_number, checkpoint.block_hash);
        }
        Self {
            checkpoint,
            transfers: BTreeMap::new(),
            balances: HashMap::new(),
            minted: U256::ZERO,
            burned: U256::ZERO,
            anchors,
        }
    }

    /// The checkpoint the ledger is consistent with.
    #[must_use]
    pub const fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    /// Number of committed transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether no transfer has been committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Committed transfers in ascending `(block_number, log_index)` order.
    pub fn transfers(&self) -> impl DoubleEndedIterator<Item = &TransferEvent> {
        self.transfers.values()
    }

    /// Balance of `address`; zero for unknown addresses.
    #[must_use]
    pub fn balance_of(&self, address: &Address) -> U256 {
        self.balances.get(address).copied().unwrap_or_default()
    }

    /// Number of addresses with a non-zero balance.
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.balances.len()
    }

    /// Total value ever minted (sent from the zero address).
    #[must_use]
    pub const fn minted(&self) -> U256 {
        self.minted
    }

    /// Total value ever burned (sent to the zero address).
    #[must_use]
    pub const fn burned(&self) -> U256 {
        self.burned
    }

    /// Circulating supply: `minted - burned`.
    #[must_use]
    pub fn total_supply(&self) -> U256 {
        self.minted.saturating_sub(self.burned)
    }

    /// A page of history ordered by `(block_number, log_index)`.
    #[must_use]
    pub fn page(&self, limit: usize, offset: usize, order: Order) -> Vec<TransferEvent> {
        let rows = self.transfers.values();
        match order {
            Order::Asc => rows.skip(offset).take(limit).cloned().collect(),
            Order::Desc => rows.rev().skip(offset).take(limit).cloned().collect(),
        }
    }

    /// The `n` largest holders, by balance descending then address ascending.
    #[must_use]
    pub fn top_holders(&self, n: usize) -> Vec<Holder> {
        let mut holders: Vec<Holder> = self
            .balances
            .iter()
            .map(|(&address, &balance)| Holder { address, balance })
            .collect();
        holders.sort_unstable_by(|a, b| {
            b.balance
                .cmp(&a.balance)
                .then_with(|| a.address.cmp(&b.address))
        });
        holders.truncate(n);
        holders
    }

    /// Validate folding `events` into the ledger and advancing to
    /// `checkpoint`, without changing anything.
    ///
    /// Events are folded in `(block_number, log_index)` order regardless of
    /// the order they are passed in. An event whose identity is already
    /// committed, or repeated within `events`, is skipped.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if an event is out of order, conflicts with
    /// another event at the same position, lies beyond `checkpoint`, or
    /// would drive a balance negative.
    pub fn stage(
        &self,
        mut events: Vec<TransferEvent>,
        checkpoint: Checkpoint,
    ) -> Result<Changeset, LedgerError> {
        if checkpoint.block_number < self.checkpoint.block_number {
            return Err(LedgerError::CheckpointRegression {
                from: self.checkpoint.block_number,
                to: checkpoint.block_number,
            });
        }

        events.sort_by_key(TransferEvent::position);
        let next_block = self.checkpoint.next_block();
        let mut tally = self.tally();
        let mut inserted: Vec<TransferEvent> = Vec::with_capacity(events.len());

        for event in events {
            let position = event.position();
            let existing = self
                .transfers
                .get(&position)
                .or_else(|| inserted.last().filter(|e| e.position() == position));
            if let Some(existing) = existing {
                if existing.key() == event.key() {
                    continue;
                }
                return Err(LedgerError::Conflict {
                    block_number: position.block_number,
                    log_index: position.log_index,
                });
            }
            if event.block_number < next_block {
                return Err(LedgerError::OutOfOrder {
                    block_number: position.block_number,
                    log_index: position.log_index,
                    next_block,
                });
            }
            if event.block_number > checkpoint.block_number {
                return Err(LedgerError::BeyondCheckpoint {
                    block_number: event.block_number,
                    checkpoint: checkpoint.block_number,
                });
            }

            tally.fold(&event)?;
            inserted.push(event);
        }

        let anchors = self.anchors_after(u64::MAX, checkpoint);
        self.seal(tally, checkpoint, inserted, Vec::new(), anchors)
    }

    /// Validate removing every event above `ancestor`, newest first, and
    /// repositioning the ledger at `ancestor`.
    ///
    /// The changeset lists removed events in removal order.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if reversing a delta would drive a balance
    /// negative, which means the projection was already corrupt.
    pub fn stage_rollback(&self, ancestor: Checkpoint) -> Result<Changeset, LedgerError> {
        let keep_below = ancestor.next_block();
        let first_removed = Position {
            block_number: keep_below,
            log_index: 0,
        };

        let mut tally = self.tally();
        let mut removed = Vec::new();
        for event in self.transfers.range(first_removed..).rev().map(|(_, e)| e) {
            tally.unfold(event)?;
            removed.push(event.clone());
        }

        let anchors = self.anchors_after(keep_below, ancestor);
        self.seal(tally, ancestor, Vec::new(), removed, anchors)
    }

    /// Apply a staged changeset. Infallible: every check ran in
    /// [`Ledger::stage`] or [`Ledger::stage_rollback`].
    pub fn absorb(&mut self, change: &Changeset) {
        for event in &change.removed {
            self.transfers.remove(&event.position());
        }
        for event in &change.inserted {
            self.transfers.insert(event.position(), event.clone());
        }
        for row in &change.balances {
            if row.balance.is_zero() {
                self.balances.remove(&row.address);
            } else {
                self.balances.insert(row.address, row.balance);
            }
        }
        self.minted = change.minted;
        self.burned = change.burned;
        self.checkpoint = change.checkpoint;
        self.anchors = change
            .anchors
            .iter()
            .map(|a| (a.block_number, a.block_hash))
            .collect();
    }

    /// Stage and absorb in one go. Returns the newly applied events.
    #[cfg(test)]
    pub(crate) fn apply(
        &mut self,
        events: Vec<TransferEvent>,
        checkpoint: Checkpoint,
    ) -> Result<Vec<TransferEvent>, LedgerError> {
        let change = self.stage(events, checkpoint)?;
        self.absorb(&change);
        Ok(change.inserted)
    }

    /// Stage and absorb a rollback. Returns the removed events, newest
    /// first.
    #[cfg(test)]
    pub(crate) fn rollback(&mut self, ancestor: Checkpoint) -> Result<Vec<TransferEvent>, LedgerError> {
        let change = self.stage_rollback(ancestor)?;
        self.absorb(&change);
        Ok(change.removed)
    }

    /// Known `(block_number, block_hash)` pairs strictly below the current
    /// checkpoint, highest first. These are the candidates for the last
    /// common ancestor after a reorg.
    #[must_use]
    pub fn fork_candidates(&self) -> Vec<(u64, B256)> {
        let below = self.checkpoint.block_number;
        let mut known: BTreeMap<u64, B256> = self
            .anchors
            .range(..below)
            .map(|(&n, &h)| (n, h))
            .collect();
        let end = Position {
            block_number: below,
            log_index: 0,
        };
        for event in self.transfers.range(..end).map(|(_, e)| e) {
            known.entry(event.block_number).or_insert(event.block_hash);
        }
        known.into_iter().rev().collect()
    }

    /// Replay the full history from scratch and check it against the
    /// incremental projection, then check the supply invariant.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Diverged`] or [`LedgerError::SupplyMismatch`]
    /// when an invariant does not hold, or the replay's own fold error.
    pub fn verify(&self) -> Result<(), LedgerError> {
        let empty = HashMap::new();
        let mut replay = Tally::over(&empty, U256::ZERO, U256::ZERO);
        for event in self.transfers.values() {
            replay.fold(event)?;
        }
        let (minted, burned) = (replay.minted, replay.burned);
        let replayed: HashMap<Address, U256> = replay
            .touched
            .into_iter()
            .filter(|(_, balance)| !balance.is_zero())
            .collect();
        self.matches(&replayed, minted, burned)?;

        let balances = self
            .balances
            .values()
            .try_fold(U256::ZERO, |acc, b| acc.checked_add(*b))
            .unwrap_or(U256::MAX);
        let supply = self.total_supply();
        if balances != supply || self.burned > self.minted {
            return Err(LedgerError::SupplyMismatch { balances, supply });
        }
        Ok(())
    }

    /// The full state as a store would load it.
    #[cfg(test)]
    pub(crate) fn to_snapshot(&self) -> Snapshot {
        let mut balances: Vec<BalanceRow> = self
            .balances
            .iter()
            .map(|(&address, &balance)| BalanceRow { address, balance })
            .collect();
        balances.sort_unstable_by_key(|row| row.address);

        Snapshot {
            checkpoint: self.checkpoint,
            transfers: self.transfers.values().cloned().collect(),
            balances,
            minted: self.minted,
            burned: self.burned,
            anchors: self
                .anchors
                .iter()
                .map(|(&block_number, &block_hash)| Anchor {
                    block_number,
                    block_hash,
                })
                .collect(),
        }
    }

    /// Rebuild a ledger from stored state and check it against a full
    /// replay of the stored history.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if two stored events share a position, the
    /// history does not fold cleanly, or the stored balances or totals
    /// disagree with the replay.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, LedgerError> {
        let mut ledger = Self::new(snapshot.checkpoint);
        for event in snapshot.transfers {
            let position = event.position();
            if ledger.transfers.insert(position, event).is_some() {
                return Err(LedgerError::Conflict {
                    block_number: position.block_number,
                    log_index: position.log_index,
                });
            }
        }
        ledger.balances = snapshot
            .balances
            .into_iter()
            .filter(|row| !row.balance.is_zero())
            .map(|row| (row.address, row.balance))
            .collect();
        ledger.minted = snapshot.minted;
        ledger.burned = snapshot.burned;
        ledger.anchors.extend(
            snapshot
                .anchors
                .into_iter()
                .map(|a| (a.block_number, a.block_hash)),
        );

        ledger.verify()?;
        Ok(ledger)
    }

    fn tally(&self) -> Tally<'_> {
        Tally::over(&self.balances, self.minted, self.burned)
    }

    /// Anchors kept below `keep_below`, plus `checkpoint`, trimmed to the
    /// window.
    fn anchors_after(&self, keep_below: u64, checkpoint: Checkpoint) -> Vec<Anchor> {
        let mut anchors: BTreeMap<u64, B256> = self
            .anchors
            .range(..keep_below)
            .map(|(&n, &h)| (n, h))
            .collect();
        if !checkpoint.is_sentinel() {
            anchors.insert(checkpoint.block_number, checkpoint.block_hash);
        }
        while anchors.len() > ANCHOR_WINDOW {
            anchors.pop_first();
        }
        anchors
            .into_iter()
            .map(|(block_number, block_hash)| Anchor {
                block_number,
                block_hash,
            })
            .collect()
    }

    /// Check that the staged change conserves supply and package it.
    fn seal(
        &self,
        tally: Tally<'_>,
        checkpoint: Checkpoint,
        inserted: Vec<TransferEvent>,
        removed: Vec<TransferEvent>,
        anchors: Vec<Anchor>,
    ) -> Result<Changeset, LedgerError> {
        let before = tally
            .touched
            .keys()
            .map(|a| self.balance_of(a))
            .fold(U256::ZERO, U256::saturating_add);
        let after = tally
            .touched
            .values()
            .copied()
            .fold(U256::ZERO, U256::saturating_add);

        // before - after == (burned' - burned) - (minted' - minted)
        let lhs = before
            .saturating_add(tally.minted)
            .saturating_add(self.burned);
        let rhs = after.saturating_add(tally.burned).saturating_add(self.minted);
        if lhs != rhs {
            return Err(LedgerError::SupplyMismatch {
                balances: after,
                supply: tally.minted.saturating_sub(tally.burned),
            });
        }

        let mut balances: Vec<BalanceRow> = tally
            .touched
            .into_iter()
            .map(|(address, balance)| BalanceRow { address, balance })
            .collect();
        balances.sort_unstable_by_key(|row| row.address);

        Ok(Changeset {
            checkpoint,
            inserted,
            removed,
            balances,
            minted: tally.minted,
            burned: tally.burned,
            anchors,
        })
    }

    fn matches(
        &self,
        balances: &HashMap<Address, U256>,
        minted: U256,
        burned: U256,
    ) -> Result<(), LedgerError> {
        if let Some(address) = self
            .balances
            .keys()
            .chain(balances.keys())
            .find(|a| self.balances.get(*a) != balances.get(*a))
        {
            return Err(LedgerError::Diverged(*address));
        }
        if minted != self.minted || burned != self.burned {
            return Err(LedgerError::SupplyMismatch {
                balances: minted.saturating_sub(burned),
                supply: self.total_supply(),
            });
        }
        Ok(())
    }
}

/// Balances and totals while folding, layered over committed balances.
///
/// `touched` holds the latest balance of every address the fold has
/// visited, including ones that dropped to zero.
#[derive(Debug)]
struct Tally<'a> {
    base: &'a HashMap<Address, U256>,
    touched: HashMap<Address, U256>,
    minted: U256,
    burned: U256,
}

impl<'a> Tally<'a> {
    fn over(base: &'a HashMap<Address, U256>, minted: U256, burned: U256) -> Self {
        Self {
            base,
            touched: HashMap::new(),
            minted,
            burned,
        }
    }

    fn balance(&self, address: &Address) -> U256 {
        self.touched
            .get(address)
            .or_else(|| self.base.get(address))
            .copied()
            .unwrap_or_default()
    }

    fn fold(&mut self, event: &TransferEvent) -> Result<(), LedgerError> {
        let overflow = || LedgerError::Overflow {
            block_number: event.block_number,
            log_index: event.log_index,
        };
        if event.is_mint() {
            self.minted = self.minted.checked_add(event.value).ok_or_else(overflow)?;
        } else {
            self.debit(event.from, event.value)?;
        }
        if event.is_burn() {
            self.burned = self.burned.checked_add(event.value).ok_or_else(overflow)?;
        } else {
            self.credit(event.to, event.value).ok_or_else(overflow)?;
        }
        Ok(())
    }

    fn unfold(&mut self, event: &TransferEvent) -> Result<(), LedgerError> {
        let overflow = || LedgerError::Overflow {
            block_number: event.block_number,
            log_index: event.log_index,
        };
        if event.is_burn() {
            self.burned = self.burned.saturating_sub(event.value);
        } else {
            self.debit(event.to, event.value)?;
        }
        if event.is_mint() {
            self.minted = self.minted.saturating_sub(event.value);
        } else {
            self.credit(event.from, event.value).ok_or_else(overflow)?;
        }
        Ok(())
    }

    fn debit(&mut self, address: Address, value: U256) -> Result<(), LedgerError> {
        let balance = self.balance(&address);
        let remaining = balance
            .checked_sub(value)
            .ok_or(LedgerError::InsufficientBalance {
                address,
                balance,
                value,
            })?;
        self.touched.insert(address, remaining);
        Ok(())
    }

    fn credit(&mut self, address: Address, value: U256) -> Option<()> {
        let balance = self.balance(&address).checked_add(value)?;
        self.touched.insert(address, balance);
        Some(())
    }
}
