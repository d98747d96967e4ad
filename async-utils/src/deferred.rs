//! Deadline-carrying deferred results.
//!
//! A [`PendingRegistry`] hands out one [`Deferred`] per key. The deferred
//! settles exactly once: either [`PendingRegistry::resolve`] delivers a value
//! or the deadline passes. Whichever happens first removes the key, so a
//! value arriving after the deadline finds nothing to resolve and is dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// Why a [`Deferred`] settled without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeferredError {
    #[error("deadline of {0:?} elapsed")]
    TimedOut(Duration),
    #[error("pending entry was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("key is already pending")]
pub struct DuplicateKey;

/// Read-only view of one outstanding entry.
#[derive(Debug, Clone)]
pub struct PendingInfo<K, M> {
    pub key: K,
    pub meta: M,
    pub created_at: Instant,
    pub deadline: Instant,
}

struct Slot<V, M> {
    generation: u64,
    tx: oneshot::Sender<V>,
    meta: M,
    created_at: Instant,
    deadline: Instant,
}

type SlotMap<K, V, M> = HashMap<K, Slot<V, M>>;

/// Map of outstanding keys to their resolvers.
pub struct PendingRegistry<K, V, M = ()> {
    slots: Arc<Mutex<SlotMap<K, V, M>>>,
    generation: Arc<AtomicU64>,
}

impl<K, V, M> Clone for PendingRegistry<K, V, M> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<K, V, M> Default for PendingRegistry<K, V, M> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<K, V, M> PendingRegistry<K, V, M>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotMap<K, V, M>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key` with a deadline `timeout` from now.
    pub fn register(
        &self,
        key: K,
        meta: M,
        timeout: Duration,
    ) -> Result<Deferred<K, V, M>, DuplicateKey> {
        let mut slots = self.lock();
        if slots.contains_key(&key) {
            return Err(DuplicateKey);
        }
        let (tx, rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let created_at = Instant::now();
        let deadline = created_at + timeout;
        slots.insert(
            key.clone(),
            Slot {
                generation,
                tx,
                meta,
                created_at,
                deadline,
            },
        );
        Ok(Deferred {
            key,
            generation,
            timeout,
            deadline,
            rx,
            slots: Arc::clone(&self.slots),
        })
    }

    /// Deliver `value` to the deferred waiting on `key`.
    ///
    /// Returns `false` when nothing is pending under `key` (never registered,
    /// already resolved, timed out, or cancelled) or the waiter is gone.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let slot = self.lock().remove(key);
        match slot {
            Some(slot) => slot.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Remove `key` without a value; its waiter sees [`DeferredError::Cancelled`].
    pub fn cancel(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of outstanding entries, earliest deadline first.
    pub fn pending(&self) -> Vec<PendingInfo<K, M>>
    where
        M: Clone,
    {
        let mut out: Vec<_> = self
            .lock()
            .iter()
            .map(|(key, slot)| PendingInfo {
                key: key.clone(),
                meta: slot.meta.clone(),
                created_at: slot.created_at,
                deadline: slot.deadline,
            })
            .collect();
        out.sort_by_key(|info| info.deadline);
        out
    }
}

/// The waiting half of a registered key.
///
/// Dropping a `Deferred` without awaiting it removes its key.
pub struct Deferred<K, V, M = ()>
where
    K: Eq + Hash,
{
    key: K,
    generation: u64,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<V>,
    slots: Arc<Mutex<SlotMap<K, V, M>>>,
}

impl<K, V, M> Deferred<K, V, M>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Remove our slot if it is still the one we registered.
    fn take_slot(&self) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&self.key) {
            Some(slot) if slot.generation == self.generation => {
                slots.remove(&self.key);
                true
            }
            _ => false,
        }
    }

    /// Wait for the value or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Result<V, DeferredError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(DeferredError::Cancelled),
            Err(_elapsed) => {
                if self.take_slot() {
                    return Err(DeferredError::TimedOut(self.timeout));
                }
                // A resolver removed the slot between the timer firing and
                // our lock; its value is already in (or on its way to) rx.
                (&mut self.rx).await.map_err(|_| DeferredError::Cancelled)
            }
        }
    }
}

impl<K, V, M> Drop for Deferred<K, V, M>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.take_slot();
    }
}
