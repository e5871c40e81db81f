//! Core domain types for the ERC-20 Transfer ledger.
//!
//! A [`TransferEvent`] is the decoded, immutable form of a single
//! `Transfer(address,address,uint256)` log. Events carry two keys:
//! an identity ([`EventKey`]) used for de-duplication, and an ordering
//! position ([`Position`]) that fixes the order in which balances are folded.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A decoded ERC-20 `Transfer` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Hash of the emitting transaction.
    pub tx_hash: B256,

    /// Index of the log within its block.
    pub log_index: u64,

    /// Height of the containing block.
    pub block_number: u64,

    /// Hash of the containing block.
    pub block_hash: B256,

    /// Sender. The zero address denotes a mint.
    pub from: Address,

    /// Recipient. The zero address denotes a burn.
    pub to: Address,

    /// Amount transferred, in the token's base units.
    pub value: U256,

    /// Block timestamp (Unix seconds).
    pub timestamp: u64,
}

impl TransferEvent {
    /// Identity of this event: `(block_hash, tx_hash, log_index)`.
    #[must_use]
    pub const fn key(&self) -> EventKey {
        EventKey {
            block_hash: self.block_hash,
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }

    /// Canonical ordering position: `(block_number, log_index)`.
    #[must_use]
    pub const fn position(&self) -> Position {
        Position {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    /// Whether this transfer creates supply (sent from the zero address).
    #[must_use]
    pub fn is_mint(&self) -> bool {
        self.from == Address::ZERO
    }

    /// Whether this transfer destroys supply (sent to the zero address).
    #[must_use]
    pub fn is_burn(&self) -> bool {
        self.to == Address::ZERO
    }
}

/// Unique identity of a committed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Hash of the containing block.
    pub block_hash: B256,
    /// Hash of the emitting transaction.
    pub tx_hash: B256,
    /// Index of the log within its block.
    pub log_index: u64,
}

/// Ordering position of an event on the canonical chain.
///
/// Ordered by block number first, then log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    /// Block height.
    pub block_number: u64,
    /// Log index within the block.
    pub log_index: u64,
}

/// A single `(address, balance)` entry of a holder ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    /// Holder address.
    pub address: Address,
    /// Current balance in base units.
    pub balance: U256,
}

/// Direction of a history page over `(block_number, log_index)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

/// An order string other than `asc` or `desc`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown order {0:?}, expected \"asc\" or \"desc\"")]
pub struct ParseOrderError(String);

impl FromStr for Order {
    type Err = ParseOrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(ParseOrderError(s.to_owned())),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        })
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{address, b256};

    use super::*;

    fn event(block_number: u64, log_index: u64) -> TransferEvent {
        TransferEvent {
            tx_hash: b256!("0x1111111111111111111111111111111111111111111111111111111111111111"),
            log_index,
            block_number,
            block_hash: B256::with_last_byte(0xaa),
            from: Address::ZERO,
            to: address!("0x00000000000000000000000000000000000a11ce"),
            value: U256::from(5),
            timestamp: 0,
        }
    }

    #[test]
    fn positions_order_by_block_then_log_index() {
        let a = event(10, 7).position();
        let b = event(11, 0).position();
        let c = event(11, 3).position();
        assert!(a < b, "lower block sorts first");
        assert!(b < c, "lower log index sorts first within a block");
    }

    #[test]
    fn mint_and_burn_follow_zero_address() {
        let mint = event(1, 0);
        assert!(mint.is_mint(), "zero sender is a mint");
        assert!(!mint.is_burn(), "non-zero recipient is not a burn");
    }

    #[test]
    fn order_defaults_to_newest_first() {
        assert_eq!(Order::default(), Order::Desc, "descending by default");
        assert_eq!("ASC".parse::<Order>(), Ok(Order::Asc), "case-insensitive");
        assert!("sideways".parse::<Order>().is_err(), "unknown direction rejected");
        assert_eq!(Order::Asc.to_string(), "asc", "display matches the parser");
    }
}
