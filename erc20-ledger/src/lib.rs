//! ERC-20 Transfer ledger.
//!
//! Decodes `Transfer(address,address,uint256)` logs into [`TransferEvent`]s
//! and folds them into a balance projection with reorg rollback, invariant
//! verification and transactional persistence of per-batch changes.

pub mod checkpoint;
pub mod decoder;
pub mod ledger;
pub mod shared;
pub mod sqlite;
pub mod store;
pub mod types;

pub use checkpoint::Checkpoint;
pub use decoder::{DecodeError, Decoder, TRANSFER_TOPIC};
pub use ledger::{Ledger, LedgerError};
pub use shared::SharedLedger;
pub use sqlite::SqliteStore;
pub use store::{Anchor, BalanceRow, Changeset, MemoryStore, Snapshot, Store, StoreError};
pub use types::{EventKey, Holder, Order, ParseOrderError, Position, TransferEvent};
