//! Raw log → [`TransferEvent`] decoding.
//!
//! Only the canonical ERC-20 shape is accepted: three topics (signature,
//! `from`, `to`) and a single 32-byte word of data (`value`). Anything else
//! is a [`DecodeError`], which callers skip rather than treat as fatal.

use alloy::primitives::{Address, B256, U256, b256};
use alloy::rpc::types::Log;
use thiserror::Error;

use crate::types::TransferEvent;

/// `keccak256("Transfer(address,address,uint256)")`.
pub const TRANSFER_TOPIC: B256 =
    b256!("0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// Reasons a log cannot be decoded into a [`TransferEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The log does not carry exactly three topics.
    #[error("expected 3 topics, found {0}")]
    TopicCount(usize),

    /// Topic0 is not the configured event signature.
    #[error("unexpected event signature {0}")]
    Signature(B256),

    /// The data payload is not a single 32-byte word.
    #[error("expected 32 bytes of data, found {0}")]
    DataLength(usize),

    /// A required log field was absent from the RPC response.
    #[error("log is missing {0}")]
    MissingField(&'static str),

    /// The node flagged the log as removed by a reorg.
    #[error("log was removed by a reorg")]
    Removed,
}

/// Decodes `Transfer` logs for a single event signature.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    topic0: B256,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(TRANSFER_TOPIC)
    }
}

impl Decoder {
    /// Create a decoder accepting logs whose topic0 equals `topic0`.
    #[must_use]
    pub const fn new(topic0: B256) -> Self {
        Self { topic0 }
    }

    /// The event signature this decoder accepts.
    #[must_use]
    pub const fn topic0(&self) -> B256 {
        self.topic0
    }

    /// Decode a single raw log.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the log does not have the ERC-20
    /// `Transfer` shape or lacks block / transaction metadata.
    pub fn decode(&self, log: &Log) -> Result<TransferEvent, DecodeError> {
        if log.removed {
            return Err(DecodeError::Removed);
        }

        let [signature, from, to] = log.topics() else {
            return Err(DecodeError::TopicCount(log.topics().len()));
        };
        if *signature != self.topic0 {
            return Err(DecodeError::Signature(*signature));
        }

        let data = &log.data().data;
        if data.len() != 32 {
            return Err(DecodeError::DataLength(data.len()));
        }
        let value = U256::try_from_be_slice(data).ok_or(DecodeError::DataLength(data.len()))?;

        Ok(TransferEvent {
            tx_hash: log
                .transaction_hash
                .ok_or(DecodeError::MissingField("transaction hash"))?,
            log_index: log.log_index.ok_or(DecodeError::MissingField("log index"))?,
            block_number: log
                .block_number
                .ok_or(DecodeError::MissingField("block number"))?,
            block_hash: log.block_hash.ok_or(DecodeError::MissingField("block hash"))?,
            from: Address::from_word(*from),
            to: Address::from_word(*to),
            value,
            timestamp: log
                .block_timestamp
                .ok_or(DecodeError::MissingField("block timestamp"))?,
        })
    }

    /// Decode a batch of logs, separating successes from rejects.
    ///
    /// Rejected logs are logged at `warn` and returned alongside their error
    /// so the caller can count them.
    #[must_use]
    pub fn decode_all(&self, logs: &[Log]) -> (Vec<TransferEvent>, Vec<DecodeError>) {
        let mut events = Vec::with_capacity(logs.len());
        let mut rejected = Vec::new();
        for log in logs {
            match self.decode(log) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(
                        block = ?log.block_number,
                        tx = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "skipping undecodable log"
                    );
                    rejected.push(e);
                }
            }
        }
        (events, rejected)
    }
}
