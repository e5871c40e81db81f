//! In-memory chain and store doubles for pipeline tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256, address, keccak256};
use alloy::rpc::types::Log;
use erc20_ledger::{Changeset, MemoryStore, Snapshot, Store, StoreError, TRANSFER_TOPIC};

use crate::error::RpcError;
use crate::fetcher::{BlockRef, ChainSource, FetchSettings, LogQuery, RetryPolicy};

pub(crate) const TOKEN: Address = address!("0x455e53cbb86018ac2b8092fdcd39d8444affc3f6");
pub(crate) const ALICE: Address = address!("0x00000000000000000000000000000000000a11ce");
pub(crate) const BOB: Address = address!("0x0000000000000000000000000000000000000b0b");
pub(crate) const CAROL: Address = address!("0x00000000000000000000000000000000000ca201");

/// Log contents before the mock chain assigns block metadata.
#[derive(Debug, Clone)]
pub(crate) struct PendingLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
}

pub(crate) fn transfer(from: Address, to: Address, value: U256) -> PendingLog {
    PendingLog {
        address: TOKEN,
        topics: vec![TRANSFER_TOPIC, from.into_word(), to.into_word()],
        data: Bytes::from(value.to_be_bytes::<32>().to_vec()),
    }
}

pub(crate) fn mint(to: Address, value: U256) -> PendingLog {
    transfer(Address::ZERO, to, value)
}

/// A `Transfer`-signature log missing its `to` topic.
pub(crate) fn malformed() -> PendingLog {
    PendingLog {
        address: TOKEN,
        topics: vec![TRANSFER_TOPIC, ALICE.into_word()],
        data: Bytes::from(U256::from(1).to_be_bytes::<32>().to_vec()),
    }
}

/// A transfer emitted by an unrelated contract.
pub(crate) fn foreign(to: Address, value: U256) -> PendingLog {
    PendingLog {
        address: Address::with_last_byte(0xee),
        ..mint(to, value)
    }
}

pub(crate) fn fetch_settings(finality_confirmations: u64, max_batch_size: u64) -> FetchSettings {
    FetchSettings {
        contract: TOKEN,
        topic0: TRANSFER_TOPIC,
        finality_confirmations,
        max_batch_size,
        request_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    }
}

#[derive(Debug)]
struct MockBlock {
    hash: B256,
    timestamp: u64,
    logs: Vec<Log>,
}

#[derive(Debug)]
struct MockState {
    blocks: Vec<MockBlock>,
    fork: u8,
    failures: u32,
    targeted: Option<(&'static str, u32)>,
    stale_logs: u32,
}

/// Canonical chain held in memory. Block 0 is an empty genesis block.
/// Clones share the same chain, so a test can keep a handle after moving
/// one into a fetcher.
#[derive(Debug, Clone)]
pub(crate) struct MockChain {
    state: Arc<Mutex<MockState>>,
}

impl MockChain {
    pub(crate) fn new() -> Self {
        let genesis = MockBlock {
            hash: Self::hash(0, 0),
            timestamp: 0,
            logs: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(MockState {
                blocks: vec![genesis],
                fork: 0,
                failures: 0,
                targeted: None,
                stale_logs: 0,
            })),
        }
    }

    fn hash(number: u64, fork: u8) -> B256 {
        let mut seed = number.to_be_bytes().to_vec();
        seed.push(fork);
        keccak256(seed)
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Append a block holding `logs`; returns its number.
    pub(crate) fn push_block(&self, logs: Vec<PendingLog>) -> u64 {
        self.with(|state| {
            let number = state.blocks.len() as u64;
            let hash = Self::hash(number, state.fork);
            let logs = logs
                .into_iter()
                .zip(0u64..)
                .map(|(pending, log_index)| Log {
                    inner: alloy::primitives::Log::new_unchecked(
                        pending.address,
                        pending.topics,
                        pending.data,
                    ),
                    block_hash: Some(hash),
                    block_number: Some(number),
                    block_timestamp: None,
                    transaction_hash: Some(keccak256(
                        [hash.as_slice(), &log_index.to_be_bytes()].concat(),
                    )),
                    transaction_index: Some(log_index),
                    log_index: Some(log_index),
                    removed: false,
                })
                .collect();
            state.blocks.push(MockBlock {
                hash,
                timestamp: number * 12,
                logs,
            });
            number
        })
    }

    /// Drop every block from `from_block` upward. Blocks pushed afterwards
    /// get hashes distinct from the dropped ones.
    pub(crate) fn reorg(&self, from_block: u64) {
        self.with(|state| {
            state
                .blocks
                .truncate(usize::try_from(from_block).unwrap_or(usize::MAX));
            state.fork += 1;
        });
    }

    /// Fail the next `n` calls of any kind.
    pub(crate) fn fail_next(&self, n: u32) {
        self.with(|state| state.failures = n);
    }

    /// Fail the next `n` calls of the RPC method `call` only.
    pub(crate) fn fail_call_next(&self, call: &'static str, n: u32) {
        self.with(|state| state.targeted = Some((call, n)));
    }

    /// Serve the next `n` log queries with a block hash that matches no
    /// header, as a node behind a load balancer might mid-reorg.
    pub(crate) fn stale_logs_next(&self, n: u32) {
        self.with(|state| state.stale_logs = n);
    }

    fn gate(&self, call: &'static str) -> Result<(), RpcError> {
        self.with(|state| {
            let targeted = match &mut state.targeted {
                Some((method, left)) if *method == call && *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if !targeted {
                if state.failures == 0 {
                    return Ok(());
                }
                state.failures -= 1;
            }
            Err(RpcError::Transport {
                call,
                message: "connection reset".to_owned(),
            })
        })
    }
}

impl ChainSource for MockChain {
    async fn head_number(&self) -> Result<u64, RpcError> {
        self.gate("eth_blockNumber")?;
        Ok(self.with(|state| state.blocks.len() as u64 - 1))
    }

    async fn block_ref(&self, number: u64) -> Result<Option<BlockRef>, RpcError> {
        self.gate("eth_getBlockByNumber")?;
        Ok(self.with(|state| {
            let block = state.blocks.get(usize::try_from(number).ok()?)?;
            Some(BlockRef {
                number,
                hash: block.hash,
                timestamp: block.timestamp,
            })
        }))
    }

    async fn logs(&self, query: LogQuery) -> Result<Vec<Log>, RpcError> {
        self.gate("eth_getLogs")?;
        Ok(self.with(|state| {
            let stale = state.stale_logs > 0;
            state.stale_logs = state.stale_logs.saturating_sub(1);
            state
                .blocks
                .iter()
                .zip(0u64..)
                .filter(|(_, n)| (query.from_block..=query.to_block).contains(n))
                .flat_map(|(block, _)| block.logs.iter())
                .filter(|log| {
                    log.address() == query.contract
                        && log.topics().first() == Some(&query.topic0)
                })
                .cloned()
                .map(|mut log| {
                    if stale {
                        log.block_hash = Some(B256::repeat_byte(0xde));
                    }
                    log
                })
                .collect()
        }))
    }
}

/// In-memory store whose commits can be made to fail on demand.
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` commits.
    pub(crate) fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Commits attempted so far, failed or not.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Store for FlakyStore {
    fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        self.inner.load()
    }

    fn commit(&self, change: &Changeset) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("disk full".to_owned()));
        }
        self.inner.commit(change)
    }
}
