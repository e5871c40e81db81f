//! Error taxonomy of the indexing pipeline.

use erc20_ledger::{LedgerError, StoreError};
use thiserror::Error;

/// A single failed chain request. Always worth retrying.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The request exceeded the configured timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Transport or node-side failure.
    #[error("{call} failed: {message}")]
    Transport {
        /// RPC method that failed.
        call: &'static str,
        /// Error reported by the transport.
        message: String,
    },

    /// The node answered with data that contradicts itself, e.g. a block
    /// that changed between two calls of the same batch.
    #[error("inconsistent chain data: {0}")]
    Inconsistent(String),
}

impl RpcError {
    /// Whether `eth_getLogs` itself failed. Only those failures say
    /// anything about the block span a node accepts.
    #[must_use]
    pub fn is_log_query(&self) -> bool {
        matches!(
            self,
            Self::Timeout(call) | Self::Transport { call, .. } if *call == "eth_getLogs"
        )
    }
}

/// Invalid startup configuration. Indexing never starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but cannot be read or parsed.
    #[error("reading {path}: {message}")]
    File {
        /// File path.
        path: String,
        /// Parser or I/O message.
        message: String,
    },

    /// A required key is absent.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// A key holds a malformed value.
    #[error("invalid `{key}` value {value:?}: {reason}")]
    Invalid {
        /// Setting name.
        key: &'static str,
        /// Offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Conditions that stop the pipeline.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Transient RPC failures persisted past the retry budget.
    #[error("RPC still failing after {attempts} attempts: {source}")]
    RpcExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        #[source]
        source: RpcError,
    },

    /// The snapshot could not be persisted or loaded.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// A batch violated ledger invariants.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Startup configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A batch does not continue from the committed checkpoint.
    #[error("batch starts at block {from_block} but the next uncommitted block is {next_block}")]
    Gap {
        /// First block of the batch.
        from_block: u64,
        /// First block not yet committed.
        next_block: u64,
    },
}
