//! The indexing loop: fetch → decode → apply, one batch at a time.
//!
//! The committed checkpoint is read once per iteration and threaded
//! explicitly through fetch and apply. Shutdown is only observed between
//! batches, never in the middle of a commit.
//!
//! [`run_with_fallback`] drives the loop over an ordered list of chain
//! sources, handing the same projector to the next source whenever one
//! exhausts its RPC retries.

use std::ops::AddAssign;
use std::time::Duration;

use erc20_ledger::{Checkpoint, Decoder, Store};
use tokio::sync::watch;

use crate::error::{ConfigError, IndexerError};
use crate::fetcher::{ChainSource, FetchSettings, Fetcher, RetryPolicy};
use crate::projector::{ApplyOutcome, DecodedBatch, Projector};

/// Loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    /// First sleep once caught up, and the sleep between storage retries.
    pub poll_interval: Duration,
    /// Ceiling of the idle sleep, which doubles on every consecutive idle
    /// poll.
    pub max_poll_interval: Duration,
    /// Consecutive failed commits tolerated before halting.
    pub max_storage_retries: u32,
}

impl LoopOptions {
    /// Sleep after the `streak`-th consecutive idle poll (1-based).
    #[must_use]
    pub fn idle_delay(&self, streak: u32) -> Duration {
        RetryPolicy {
            max_attempts: streak,
            base_delay: self.poll_interval,
            max_delay: self.max_poll_interval.max(self.poll_interval),
        }
        .delay(streak)
    }
}

/// Running counters, logged on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerStats {
    /// Batches committed.
    pub batches: u64,
    /// Transfers committed.
    pub transfers: u64,
    /// Logs skipped as undecodable in committed batches.
    pub decode_errors: u64,
    /// Reorgs handled.
    pub reorgs: u64,
    /// Transfers removed by reorgs.
    pub retracted: u64,
}

impl AddAssign for IndexerStats {
    fn add_assign(&mut self, other: Self) {
        self.batches += other.batches;
        self.transfers += other.transfers;
        self.decode_errors += other.decode_errors;
        self.reorgs += other.reorgs;
        self.retracted += other.retracted;
    }
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No finalized block past the checkpoint yet.
    Idle,
    /// A batch was committed.
    Committed {
        /// Newly applied transfers.
        applied: usize,
        /// Undecodable logs skipped.
        skipped: usize,
        /// New checkpoint.
        checkpoint: Checkpoint,
    },
    /// The batch had already been committed.
    AlreadyApplied,
    /// A reorg was rolled back to `ancestor`.
    Reorg {
        /// New checkpoint.
        ancestor: Checkpoint,
    },
}

/// Single-writer indexing loop.
#[derive(Debug)]
pub struct Indexer<C, S> {
    fetcher: Fetcher<C>,
    decoder: Decoder,
    projector: Projector<S>,
    options: LoopOptions,
    stats: IndexerStats,
}

impl<C: ChainSource, S: Store> Indexer<C, S> {
    /// Assemble the loop. The decoder accepts the fetcher's topic0.
    pub fn new(fetcher: Fetcher<C>, projector: Projector<S>, options: LoopOptions) -> Self {
        Self {
            decoder: Decoder::new(fetcher.settings().topic0),
            fetcher,
            projector,
            options,
            stats: IndexerStats::default(),
        }
    }

    /// Counters since construction.
    pub const fn stats(&self) -> IndexerStats {
        self.stats
    }

    /// The projector, for reuse with another fetcher.
    pub fn into_projector(self) -> Projector<S> {
        self.projector
    }

    /// Run one fetch → decode → apply iteration.
    ///
    /// # Errors
    ///
    /// Propagates RPC exhaustion, ledger, gap and storage errors.
    pub async fn step(&mut self) -> Result<Step, IndexerError> {
        let checkpoint = self.projector.checkpoint();
        let Some(fetched) = self.fetcher.fetch_batch(checkpoint.next_block()).await? else {
            return Ok(Step::Idle);
        };

        let (events, rejected) = self.decoder.decode_all(&fetched.logs);
        let batch = DecodedBatch {
            from_block: fetched.from_block,
            to_block: fetched.to_block,
            to_block_hash: fetched.to_block_hash,
            events,
        };

        let step = match self
            .projector
            .apply(&self.fetcher, batch, checkpoint)
            .await?
        {
            ApplyOutcome::Committed {
                applied,
                checkpoint,
            } => {
                self.stats.batches += 1;
                self.stats.transfers += applied as u64;
                self.stats.decode_errors += rejected.len() as u64;
                Step::Committed {
                    applied,
                    skipped: rejected.len(),
                    checkpoint,
                }
            }
            ApplyOutcome::AlreadyApplied => Step::AlreadyApplied,
            ApplyOutcome::ReorgDetected {
                ancestor,
                retracted,
            } => {
                self.stats.reorgs += 1;
                self.stats.retracted += retracted as u64;
                Step::Reorg { ancestor }
            }
        };
        Ok(step)
    }

    /// Index until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Failed commits are retried from the same checkpoint up to
    /// `max_storage_retries` consecutive times.
    ///
    /// # Errors
    ///
    /// Returns the first error that is not a retryable storage failure.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<IndexerStats, IndexerError> {
        let checkpoint = self.projector.checkpoint();
        tracing::info!(
            next_block = checkpoint.next_block(),
            contract = %self.fetcher.settings().contract,
            "indexer started"
        );

        let mut storage_failures = 0u32;
        let mut idle_streak = 0u32;
        while !*shutdown.borrow() {
            match self.step().await {
                Ok(Step::Idle) => {
                    idle_streak = idle_streak.saturating_add(1);
                    let delay = self.options.idle_delay(idle_streak);
                    if pause(delay, &mut shutdown).await {
                        break;
                    }
                }
                Ok(_) => {
                    storage_failures = 0;
                    idle_streak = 0;
                }
                Err(IndexerError::Storage(e))
                    if storage_failures < self.options.max_storage_retries =>
                {
                    storage_failures += 1;
                    tracing::warn!(
                        attempt = storage_failures,
                        error = %e,
                        "commit failed, retrying batch"
                    );
                    if pause(self.options.poll_interval, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let stats = self.stats;
        tracing::info!(
            batches = stats.batches,
            transfers = stats.transfers,
            decode_errors = stats.decode_errors,
            reorgs = stats.reorgs,
            "indexer stopped"
        );
        Ok(stats)
    }
}

/// Sleep for `delay`; `true` if shutdown was requested meanwhile.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Index from each of `chains` in turn until shutdown.
///
/// A source that exhausts its RPC retries is abandoned and the next one
/// resumes from the committed checkpoint with the same projector, so the
/// ledger and its subscribers carry over. Returns the combined counters.
///
/// # Errors
///
/// Returns the last [`IndexerError::RpcExhausted`] once every source has
/// failed, [`ConfigError::Missing`] when `chains` is empty, or the first
/// error that is not an RPC exhaustion.
pub async fn run_with_fallback<C, S>(
    chains: impl IntoIterator<Item = C>,
    mut projector: Projector<S>,
    fetch: FetchSettings,
    options: LoopOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<IndexerStats, IndexerError>
where
    C: ChainSource,
    S: Store,
{
    let mut total = IndexerStats::default();
    let mut last_failure = None;

    for (endpoint, chain) in chains.into_iter().enumerate() {
        let mut indexer = Indexer::new(Fetcher::new(chain, fetch), projector, options);
        let result = indexer.run(shutdown.clone()).await;
        total += indexer.stats();

        match result {
            Ok(_) => return Ok(total),
            Err(e @ IndexerError::RpcExhausted { .. }) => {
                tracing::error!(endpoint, error = %e, "endpoint failed, falling back");
                projector = indexer.into_projector();
                last_failure = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_failure.unwrap_or(IndexerError::Config(ConfigError::Missing("rpc_urls"))))
}
