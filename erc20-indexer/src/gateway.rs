//! Read-side API over the committed ledger.
//!
//! Every query takes one [`SharedLedger`] snapshot and answers from it, so
//! results never mix two batches or include rolled-back events.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use erc20_ledger::{Checkpoint, Holder, Ledger, Order, SharedLedger, TransferEvent};
use serde::Serialize;

use crate::subscription::{Hub, Subscription};

/// One page of transfer history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    /// Transfers on this page.
    pub items: Vec<TransferEvent>,
    /// Total committed transfers at the time of the query.
    pub total: usize,
    /// Offset this page starts at, counted in `order`.
    pub offset: usize,
    /// Direction of the page.
    pub order: Order,
}

/// Query and subscription entry point for API consumers.
#[derive(Debug, Clone)]
pub struct Gateway {
    ledger: SharedLedger,
    hub: Arc<Hub>,
}

impl Gateway {
    /// A gateway reading `ledger` and subscribing through `hub`.
    #[must_use]
    pub const fn new(ledger: SharedLedger, hub: Arc<Hub>) -> Self {
        Self { ledger, hub }
    }

    /// Committed transfers ordered by `(block_number, log_index)`, newest
    /// first unless `order` says otherwise.
    #[must_use]
    pub fn list_transfers(&self, limit: usize, offset: usize, order: Order) -> Page {
        Self::page_of(&self.ledger.snapshot(), limit, offset, order)
    }

    /// A history page read straight from `ledger`, for offline queries.
    #[must_use]
    pub fn page_of(ledger: &Ledger, limit: usize, offset: usize, order: Order) -> Page {
        Page {
            items: ledger.page(limit, offset, order),
            total: ledger.len(),
            offset,
            order,
        }
    }

    /// The `n` largest holders, ties broken by address ascending.
    #[must_use]
    pub fn top_holders(&self, n: usize) -> Vec<Holder> {
        self.ledger.snapshot().top_holders(n)
    }

    /// Current balance of `address`.
    #[must_use]
    pub fn balance_of(&self, address: &Address) -> U256 {
        self.ledger.snapshot().balance_of(address)
    }

    /// Circulating supply (`minted - burned`).
    #[must_use]
    pub fn total_supply(&self) -> U256 {
        self.ledger.snapshot().total_supply()
    }

    /// Last committed checkpoint.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        self.ledger.snapshot().checkpoint()
    }

    /// Live feed of transfers committed from now on, plus retractions.
    #[must_use]
    pub fn subscribe_transfers(&self) -> Subscription {
        self.hub.subscribe()
    }
}
