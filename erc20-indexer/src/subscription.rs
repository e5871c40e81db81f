//! Live fan-out of committed ledger changes.
//!
//! Every subscriber owns a bounded channel of commits: each committed batch
//! or rollback travels as one shared slice of notifications, however many
//! transfers it holds. The [`Hub`] never waits on a subscriber: a channel
//! already holding `capacity` undelivered commits gets the subscriber
//! dropped, and once it has drained what was already buffered it observes
//! [`SubscriptionError::Overflow`]. Clients recover by re-subscribing and
//! replaying history from their last known block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use erc20_ledger::TransferEvent;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Notifications of one commit, shared by every subscriber.
type Commit = Arc<[Notification]>;

/// A change pushed to subscribers after it became durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A newly committed transfer.
    Transfer(TransferEvent),
    /// A previously pushed transfer removed by a reorg.
    Retracted(TransferEvent),
}

/// Lifecycle of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, nothing received yet.
    Connected,
    /// At least one notification received.
    Streaming,
    /// The hub went away. Nothing more will arrive.
    Disconnected,
    /// Dropped for falling behind.
    Error,
}

/// Terminal subscription failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The subscriber's buffer filled up and it was disconnected.
    #[error("subscriber fell more than {0} commits behind and was disconnected")]
    Overflow(usize),
}

#[derive(Debug)]
struct Sink {
    id: u64,
    tx: mpsc::Sender<Commit>,
    overflowed: Arc<AtomicBool>,
}

/// Fans committed notifications out to all live subscribers.
#[derive(Debug)]
pub struct Hub {
    sinks: Mutex<Vec<Sink>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl Hub {
    /// A hub giving each subscriber a buffer of `capacity` commits.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Sink {
                id,
                tx,
                overflowed: Arc::clone(&overflowed),
            });
        tracing::debug!(subscriber = id, "subscriber connected");

        Subscription {
            id,
            rx,
            overflowed,
            capacity: self.capacity,
            state: SubscriptionState::Connected,
            pending: None,
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Push the notifications of one commit to every subscriber, in order,
    /// without blocking. The commit takes one buffer slot per subscriber.
    pub fn publish(&self, notifications: impl IntoIterator<Item = Notification>) {
        let commit: Commit = notifications.into_iter().collect();
        if commit.is_empty() {
            return;
        }

        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        sinks.retain(|sink| match sink.tx.try_send(Arc::clone(&commit)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sink.overflowed.store(true, Ordering::Release);
                tracing::warn!(
                    subscriber = sink.id,
                    capacity = self.capacity,
                    "subscriber overflowed, disconnecting"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = sink.id, "subscriber went away");
                false
            }
        });
    }
}

/// Receiving end of a live transfer feed.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Commit>,
    overflowed: Arc<AtomicBool>,
    capacity: usize,
    state: SubscriptionState,
    /// Commit being handed out and the index of its next notification.
    pending: Option<(Commit, usize)>,
}

impl Subscription {
    /// Hub-assigned identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Wait for the next notification.
    ///
    /// Returns `Ok(None)` once the hub has shut down.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Overflow`] after the subscriber was
    /// dropped for falling behind and its buffer has been drained.
    pub async fn next(&mut self) -> Result<Option<Notification>, SubscriptionError> {
        if let Some(notification) = self.buffered() {
            return Ok(Some(notification));
        }
        if let Some(end) = self.terminal() {
            return end;
        }
        let received = self.rx.recv().await;
        self.settle(received)
    }

    /// Take an already buffered notification without waiting.
    ///
    /// Returns `Ok(None)` when nothing is buffered or the hub has shut down.
    ///
    /// # Errors
    ///
    /// Same as [`Subscription::next`].
    pub fn try_next(&mut self) -> Result<Option<Notification>, SubscriptionError> {
        if let Some(notification) = self.buffered() {
            return Ok(Some(notification));
        }
        if let Some(end) = self.terminal() {
            return end;
        }
        match self.rx.try_recv() {
            Ok(commit) => self.settle(Some(commit)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => self.settle(None),
        }
    }

    fn buffered(&mut self) -> Option<Notification> {
        let (commit, next) = self.pending.as_mut()?;
        let notification = commit.get(*next).cloned();
        *next += 1;
        if *next >= commit.len() {
            self.pending = None;
        }
        notification
    }

    fn terminal(&self) -> Option<Result<Option<Notification>, SubscriptionError>> {
        match self.state {
            SubscriptionState::Disconnected => Some(Ok(None)),
            SubscriptionState::Error => Some(Err(SubscriptionError::Overflow(self.capacity))),
            SubscriptionState::Connected | SubscriptionState::Streaming => None,
        }
    }

    fn settle(
        &mut self,
        received: Option<Commit>,
    ) -> Result<Option<Notification>, SubscriptionError> {
        match received {
            Some(commit) => {
                self.state = SubscriptionState::Streaming;
                self.pending = Some((commit, 0));
                Ok(self.buffered())
            }
            None if self.overflowed.load(Ordering::Acquire) => {
                self.state = SubscriptionState::Error;
                Err(SubscriptionError::Overflow(self.capacity))
            }
            None => {
                self.state = SubscriptionState::Disconnected;
                Ok(None)
            }
        }
    }
}
