//! Indexing progress marker.
//!
//! The checkpoint records the last block whose logs have been fully folded
//! into the ledger, together with that block's hash so that a later run can
//! tell whether the chain still agrees with what was indexed.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

/// Last safely processed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Height of the last processed block, or the deployment block while
    /// nothing has been processed yet.
    pub block_number: u64,
    /// Hash of that block. [`B256::ZERO`] marks the initial sentinel.
    pub block_hash: B256,
    /// Unix timestamp (seconds) of the commit that wrote this checkpoint.
    pub updated_at: u64,
}

impl Checkpoint {
    /// The checkpoint used when no state has been stored yet.
    ///
    /// Its sentinel hash means the first batch's parent is trusted
    /// unconditionally.
    #[must_use]
    pub const fn initial(deployment_block: u64) -> Self {
        Self {
            block_number: deployment_block,
            block_hash: B256::ZERO,
            updated_at: 0,
        }
    }

    /// A checkpoint at `block_number` stamped with the current time.
    #[must_use]
    pub fn now(block_number: u64, block_hash: B256) -> Self {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            block_number,
            block_hash,
            updated_at,
        }
    }

    /// Whether this is the "nothing processed yet" sentinel.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.block_hash == B256::ZERO
    }

    /// The first block that has not been folded into the ledger.
    #[must_use]
    pub fn next_block(&self) -> u64 {
        if self.is_sentinel() {
            self.block_number
        } else {
            self.block_number + 1
        }
    }

    /// Same block and hash, ignoring the commit timestamp.
    #[must_use]
    pub fn same_block(&self, other: &Self) -> bool {
        self.block_number == other.block_number && self.block_hash == other.block_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_checkpoint_resumes_at_deployment_block() {
        let cp = Checkpoint::initial(500);
        assert!(cp.is_sentinel(), "initial checkpoint has the zero hash");
        assert_eq!(cp.next_block(), 500, "deployment block itself is fetched");
    }

    #[test]
    fn committed_checkpoint_resumes_after_its_block() {
        let cp = Checkpoint::now(500, B256::with_last_byte(1));
        assert!(!cp.is_sentinel(), "real hash is not the sentinel");
        assert_eq!(cp.next_block(), 501, "next block follows the checkpoint");
        assert!(cp.updated_at > 0, "commit time is stamped");
    }

    #[test]
    fn same_block_ignores_timestamp() {
        let a = Checkpoint::now(7, B256::with_last_byte(9));
        let b = Checkpoint {
            updated_at: 1,
            ..a
        };
        assert!(a.same_block(&b), "timestamps do not affect identity");
    }
}
