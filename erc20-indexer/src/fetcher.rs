//! RPC log fetching.
//!
//! Each call to [`Fetcher::fetch_batch`]:
//! 1. Reads the chain head and derives the highest finalized block
//!    (`head - finality_confirmations`).
//! 2. Fetches the header of the batch's last block (its hash becomes the
//!    next checkpoint).
//! 3. Queries `eth_getLogs` for the contract + topic0 over the batch range,
//!    using an adaptive span that shrinks when the log query itself fails.
//! 4. Fills missing log timestamps from block headers and rejects a batch
//!    whose logs disagree with those headers (the chain moved mid-batch).
//!
//! Transient failures are retried with exponential backoff; once the retry
//! budget is spent the failure surfaces as [`IndexerError::RpcExhausted`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};

use crate::error::{IndexerError, RpcError};

/// Exponential backoff schedule for transient RPC failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Fetcher tuning and filter.
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    /// Token contract address.
    pub contract: Address,
    /// Event signature hash.
    pub topic0: B256,
    /// Blocks kept between the indexed tip and the head.
    pub finality_confirmations: u64,
    /// Upper bound on blocks per log query.
    pub max_batch_size: u64,
    /// Per-request timeout, applied by [`RpcChain`].
    pub request_timeout: Duration,
    /// Retry schedule.
    pub retry: RetryPolicy,
}

/// Minimal header data the pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    /// Block height.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Block timestamp (Unix seconds).
    pub timestamp: u64,
}

/// An `eth_getLogs` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogQuery {
    /// Emitting contract.
    pub contract: Address,
    /// Required topic0.
    pub topic0: B256,
    /// First block, inclusive.
    pub from_block: u64,
    /// Last block, inclusive.
    pub to_block: u64,
}

/// The chain RPC surface consumed by the indexer.
pub trait ChainSource: Send + Sync {
    /// Current head block number.
    fn head_number(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    /// Header of the canonical block at `number`, if the node has it.
    fn block_ref(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Option<BlockRef>, RpcError>> + Send;

    /// Logs matching `query`.
    fn logs(&self, query: LogQuery) -> impl Future<Output = Result<Vec<Log>, RpcError>> + Send;
}

/// [`ChainSource`] backed by an alloy [`Provider`], with a per-request
/// timeout on every call.
#[derive(Debug, Clone)]
pub struct RpcChain<P> {
    provider: P,
    timeout: Duration,
}

impl<P> RpcChain<P> {
    /// Wrap `provider`, bounding each request by `timeout`.
    pub const fn new(provider: P, timeout: Duration) -> Self {
        Self { provider, timeout }
    }
}

fn transport(call: &'static str, error: impl ToString) -> RpcError {
    RpcError::Transport {
        call,
        message: error.to_string(),
    }
}

impl<P: Provider> ChainSource for RpcChain<P> {
    async fn head_number(&self) -> Result<u64, RpcError> {
        const CALL: &str = "eth_blockNumber";
        tokio::time::timeout(self.timeout, self.provider.get_block_number())
            .await
            .map_err(|_| RpcError::Timeout(CALL))?
            .map_err(|e| transport(CALL, e))
    }

    async fn block_ref(&self, number: u64) -> Result<Option<BlockRef>, RpcError> {
        const CALL: &str = "eth_getBlockByNumber";
        let block = tokio::time::timeout(
            self.timeout,
            self.provider
                .get_block_by_number(BlockNumberOrTag::Number(number)),
        )
        .await
        .map_err(|_| RpcError::Timeout(CALL))?
        .map_err(|e| transport(CALL, e))?;

        Ok(block.map(|b| BlockRef {
            number,
            hash: b.header.hash,
            timestamp: b.header.timestamp,
        }))
    }

    async fn logs(&self, query: LogQuery) -> Result<Vec<Log>, RpcError> {
        const CALL: &str = "eth_getLogs";
        let filter = Filter::new()
            .address(query.contract)
            .event_signature(query.topic0)
            .from_block(query.from_block)
            .to_block(query.to_block);

        tokio::time::timeout(self.timeout, self.provider.get_logs(&filter))
            .await
            .map_err(|_| RpcError::Timeout(CALL))?
            .map_err(|e| transport(CALL, e))
    }
}

/// Tracks the `eth_getLogs` span with an adaptive ceiling.
///
/// On success the span doubles toward the ceiling; on a failed log query
/// the ceiling is lowered so the node's actual range limit is learned once.
#[derive(Debug)]
struct Batcher {
    size: u64,
    ceiling: u64,
    min: u64,
}

impl Batcher {
    const MIN: u64 = 10;

    fn new(max: u64) -> Self {
        Self {
            size: max,
            ceiling: max,
            min: Self::MIN.min(max),
        }
    }

    /// Grow toward the learned ceiling after a successful request.
    fn grow(&mut self) {
        self.size = self.size.saturating_mul(2).min(self.ceiling);
    }

    /// Shrink and lower the ceiling after a failed request.
    /// Returns `false` when already at the minimum.
    fn shrink(&mut self) -> bool {
        if self.size <= self.min {
            return false;
        }
        self.ceiling = (self.size / 2).max(self.min);
        self.size = self.ceiling;
        true
    }
}

/// A range of finalized blocks and the matching raw logs.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    /// First block of the range.
    pub from_block: u64,
    /// Last block of the range.
    pub to_block: u64,
    /// Hash of `to_block` when it was fetched.
    pub to_block_hash: B256,
    /// Chain head observed for this batch.
    pub head: u64,
    /// Matching logs, timestamps filled in.
    pub logs: Vec<Log>,
}

/// Pulls finalized log batches from a [`ChainSource`].
#[derive(Debug)]
pub struct Fetcher<C> {
    chain: C,
    settings: FetchSettings,
    batcher: Batcher,
}

impl<C: ChainSource> Fetcher<C> {
    /// A fetcher over `chain`.
    pub fn new(chain: C, settings: FetchSettings) -> Self {
        Self {
            chain,
            batcher: Batcher::new(settings.max_batch_size),
            settings,
        }
    }

    /// The underlying chain source.
    pub const fn chain(&self) -> &C {
        &self.chain
    }

    /// Filter and tuning in use.
    pub const fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Fetch the next batch starting at `from_block`.
    ///
    /// Returns `Ok(None)` when no finalized block at or above `from_block`
    /// exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::RpcExhausted`] once a call has failed
    /// `max_attempts` times in a row.
    pub async fn fetch_batch(
        &mut self,
        from_block: u64,
    ) -> Result<Option<FetchedBatch>, IndexerError> {
        let head = self.retrying(|| self.chain.head_number()).await?;
        let Some(finalized) = head.checked_sub(self.settings.finality_confirmations) else {
            return Ok(None);
        };
        if finalized < from_block {
            tracing::debug!(from_block, head, finalized, "no new finalized blocks");
            return Ok(None);
        }

        let policy = self.settings.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let to_block = finalized.min(from_block.saturating_add(self.batcher.size - 1));

            match self.try_fetch(from_block, to_block).await {
                Ok((logs, tip)) => {
                    self.batcher.grow();
                    tracing::debug!(
                        from_block,
                        to_block,
                        head,
                        logs = logs.len(),
                        "fetched batch"
                    );
                    return Ok(Some(FetchedBatch {
                        from_block,
                        to_block,
                        to_block_hash: tip.hash,
                        head,
                        logs,
                    }));
                }
                Err(source) if attempt >= policy.max_attempts => {
                    return Err(IndexerError::RpcExhausted {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    if e.is_log_query() {
                        self.batcher.shrink();
                    }
                    tracing::warn!(
                        from_block,
                        to_block,
                        attempt,
                        batch_size = self.batcher.size,
                        error = %e,
                        "batch fetch failed, retrying"
                    );
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
        }
    }

    /// Header of the canonical block at `number`, with retries.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::RpcExhausted`] once the retry budget is spent.
    pub async fn block_ref(&self, number: u64) -> Result<Option<BlockRef>, IndexerError> {
        self.retrying(|| self.chain.block_ref(number)).await
    }

    async fn try_fetch(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<(Vec<Log>, BlockRef), RpcError> {
        let missing = |n: u64| RpcError::Inconsistent(format!("block {n} not available"));

        let tip = self
            .chain
            .block_ref(to_block)
            .await?
            .ok_or_else(|| missing(to_block))?;

        let mut logs = self
            .chain
            .logs(LogQuery {
                contract: self.settings.contract,
                topic0: self.settings.topic0,
                from_block,
                to_block,
            })
            .await?;

        let mut headers = HashMap::from([(to_block, tip)]);
        for log in &mut logs {
            let Some(number) = log.block_number else {
                continue;
            };
            let block = match headers.get(&number) {
                Some(block) => *block,
                None => {
                    let block = self
                        .chain
                        .block_ref(number)
                        .await?
                        .ok_or_else(|| missing(number))?;
                    headers.insert(number, block);
                    block
                }
            };
            if log.block_hash.is_some_and(|hash| hash != block.hash) {
                return Err(RpcError::Inconsistent(format!(
                    "log in block {number} does not match header {}",
                    block.hash
                )));
            }
            if log.block_timestamp.is_none() {
                log.block_timestamp = Some(block.timestamp);
            }
        }

        Ok((logs, tip))
    }

    async fn retrying<T, F, Fut>(&self, mut call: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let policy = self.settings.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(source) if attempt >= policy.max_attempts => {
                    return Err(IndexerError::RpcExhausted {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "RPC call failed, retrying");
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::U256;

    use super::*;
    use crate::testing::{ALICE, MockChain, fetch_settings, mint};

    fn three_blocks() -> MockChain {
        let chain = MockChain::new();
        for n in 1..=3u64 {
            chain.push_block(vec![mint(ALICE, U256::from(n))]);
        }
        chain
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100), "first delay");
        assert_eq!(policy.delay(2), Duration::from_millis(200), "doubled");
        assert_eq!(policy.delay(3), Duration::from_millis(350), "capped");
        assert_eq!(policy.delay(40), Duration::from_millis(350), "no overflow");
    }

    #[test]
    fn batcher_learns_ceiling() {
        let mut batcher = Batcher::new(80);
        assert!(batcher.shrink(), "80 can shrink");
        assert_eq!(batcher.size, 40, "halved");
        batcher.grow();
        assert_eq!(batcher.size, 40, "ceiling lowered permanently");
        while batcher.shrink() {}
        assert_eq!(batcher.size, Batcher::MIN, "floors at the minimum");
    }

    #[tokio::test]
    async fn stays_behind_finality_depth() {
        let chain = MockChain::new();
        for _ in 0..5 {
            chain.push_block(Vec::new());
        }
        let mut fetcher = Fetcher::new(chain, fetch_settings(2, 100));

        let batch = fetcher.fetch_batch(1).await.unwrap().unwrap();
        assert_eq!(batch.head, 5, "head observed");
        assert_eq!(batch.to_block, 3, "two blocks of finality withheld");

        assert!(
            fetcher.fetch_batch(4).await.unwrap().is_none(),
            "nothing finalized past block 3"
        );
    }

    #[tokio::test]
    async fn caps_range_at_batch_size_and_fills_timestamps() {
        let chain = MockChain::new();
        for n in 1..=10u64 {
            chain.push_block(vec![mint(ALICE, U256::from(n))]);
        }
        let mut fetcher = Fetcher::new(chain, fetch_settings(1, 4));

        let batch = fetcher.fetch_batch(1).await.unwrap().unwrap();
        assert_eq!((batch.from_block, batch.to_block), (1, 4), "capped span");
        assert_eq!(batch.logs.len(), 4, "one log per block");
        assert!(
            batch.logs.iter().all(|l| l.block_timestamp.is_some()),
            "timestamps filled from headers"
        );
        let tip = fetcher.chain().block_ref(4).await.unwrap().unwrap();
        assert_eq!(batch.to_block_hash, tip.hash, "checkpoint hash of last block");
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let chain = MockChain::new();
        chain.push_block(Vec::new());
        chain.push_block(Vec::new());
        chain.fail_next(2);
        let mut fetcher = Fetcher::new(chain, fetch_settings(1, 10));

        let batch = fetcher.fetch_batch(1).await.unwrap();
        assert!(batch.is_some(), "recovered after two failures");
    }

    #[tokio::test]
    async fn escalates_persistent_failures() {
        let chain = MockChain::new();
        chain.push_block(Vec::new());
        chain.fail_next(u32::MAX);
        let mut fetcher = Fetcher::new(chain, fetch_settings(1, 10));

        let err = fetcher.fetch_batch(1).await.unwrap_err();
        assert!(
            matches!(err, IndexerError::RpcExhausted { attempts: 3, .. }),
            "fatal after the retry budget: {err}"
        );
    }

    #[tokio::test]
    async fn retries_logs_that_disagree_with_headers() {
        let chain = three_blocks();
        chain.stale_logs_next(1);
        let mut fetcher = Fetcher::new(chain.clone(), fetch_settings(1, 100));

        let batch = fetcher.fetch_batch(1).await.unwrap().unwrap();
        assert_eq!(batch.logs.len(), 2, "blocks 1 and 2 fetched");
        for log in &batch.logs {
            let header = chain.block_ref(log.block_number.unwrap()).await.unwrap().unwrap();
            assert_eq!(log.block_hash, Some(header.hash), "retried logs match headers");
        }
        assert_eq!(fetcher.batcher.size, 100, "inconsistency is not a range problem");

        chain.stale_logs_next(u32::MAX);
        let err = fetcher.fetch_batch(1).await.unwrap_err();
        assert!(
            matches!(
                err,
                IndexerError::RpcExhausted {
                    source: RpcError::Inconsistent(_),
                    ..
                }
            ),
            "persistent inconsistency escalates: {err}"
        );
    }

    #[tokio::test]
    async fn only_log_query_failures_shrink_the_span() {
        let chain = three_blocks();
        let mut fetcher = Fetcher::new(chain.clone(), fetch_settings(1, 80));

        chain.fail_call_next("eth_getBlockByNumber", 1);
        assert!(fetcher.fetch_batch(1).await.unwrap().is_some(), "header retried");
        assert_eq!(fetcher.batcher.size, 80, "header failure keeps the span");

        chain.fail_call_next("eth_getLogs", 1);
        assert!(fetcher.fetch_batch(1).await.unwrap().is_some(), "log query retried");
        assert_eq!(fetcher.batcher.size, 40, "log failure halves the span");
        assert_eq!(fetcher.batcher.ceiling, 40, "and lowers the ceiling");
    }
}
