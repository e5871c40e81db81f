//! ERC-20 Transfer indexer.
//!
//! Polls an RPC endpoint for finalized `Transfer` logs of one token,
//! projects them into an [`erc20_ledger::Ledger`] with reorg rollback, and
//! serves paginated history, top holders and a live transfer feed.

pub mod config;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod gateway;
pub mod pipeline;
pub mod projector;
pub mod subscription;

#[cfg(test)]
mod testing;
