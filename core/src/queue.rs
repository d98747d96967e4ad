//! Bounded FIFO delivery queue for outbound payloads.
//!
//! Items wait here while the backend is unreachable. Draining is strictly
//! sequential and stops at the first failure, leaving the failed item at the
//! head so the next drain retries it first.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What happens when an item arrives at a full queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest resident item to make room.
    #[default]
    DropOldest,
    /// Refuse the incoming item.
    RejectNew,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("delivery queue full ({capacity} items), new item rejected")]
    Full { capacity: usize },
}

/// A sink refused or failed to take an item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

#[async_trait]
pub trait DeliverySink<T>: Send + Sync {
    async fn deliver(&self, item: &T) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct QueueEntry<T> {
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    pub item: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting the oldest item.
    QueuedEvictedOldest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub remaining: usize,
    /// Error of the send that stopped this drain, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
    /// Another drain was already running; nothing was attempted.
    #[serde(default)]
    pub skipped: bool,
}

struct QueueState<T> {
    entries: VecDeque<QueueEntry<T>>,
    next_seq: u64,
}

pub struct DeliveryQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    drain_gate: tokio::sync::Mutex<()>,
}

impl<T: Clone> DeliveryQueue<T> {
    /// `capacity` is clamped to at least one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 0,
            }),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
            drain_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, item: T) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.lock();
        let mut outcome = EnqueueOutcome::Queued;
        if state.entries.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::RejectNew => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        capacity = self.capacity,
                        dropped_total = total,
                        "delivery queue full, rejecting new item"
                    );
                    return Err(QueueError::Full {
                        capacity: self.capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    let evicted = state.entries.pop_front();
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        capacity = self.capacity,
                        evicted_seq = evicted.map(|e| e.seq),
                        dropped_total = total,
                        "delivery queue full, evicted oldest item"
                    );
                    outcome = EnqueueOutcome::QueuedEvictedOldest;
                }
            }
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push_back(QueueEntry {
            seq,
            enqueued_at: Utc::now(),
            item,
        });
        Ok(outcome)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Items evicted or rejected since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<QueueEntry<T>> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Deliver queued items in insertion order until empty or a send fails.
    ///
    /// The lock is not held across the send, so producers keep enqueueing
    /// while a drain runs. If the head was evicted during the send, the
    /// delivered item is simply not acknowledged twice.
    pub async fn drain<S>(&self, sink: &S) -> DrainReport
    where
        S: DeliverySink<T> + ?Sized,
    {
        let Ok(_gate) = self.drain_gate.try_lock() else {
            return DrainReport {
                remaining: self.len(),
                skipped: true,
                ..DrainReport::default()
            };
        };

        let mut report = DrainReport::default();
        loop {
            let head = self.lock().entries.front().cloned();
            let Some(head) = head else {
                break;
            };
            match sink.deliver(&head.item).await {
                Ok(()) => {
                    let mut state = self.lock();
                    if state.entries.front().map(|e| e.seq) == Some(head.seq) {
                        state.entries.pop_front();
                    }
                    report.delivered += 1;
                }
                Err(e) => {
                    tracing::debug!(seq = head.seq, error = %e, "drain stopped at failed entry");
                    report.failed = Some(e.0);
                    break;
                }
            }
        }
        report.remaining = self.len();
        report
    }
}
