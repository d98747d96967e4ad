//! Context bridge between the host page and the relay process.
//!
//! The bridge moves envelopes in two directions without interpreting their
//! payloads:
//!
//! - host → relay: `capture`, `command_result` and `surfaces` envelopes,
//!   fire-and-forget (at most once, no acknowledgment).
//! - relay → host: `command` envelopes.
//!
//! Before every privileged call it checks the relay port. Once the port is
//! found permanently invalid the bridge logs that once and silently drops
//! everything afterwards instead of failing on each envelope.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use pagetap_protocol::{Envelope, MessageKind};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// The other side is gone for good.
    #[error("channel invalidated")]
    Invalidated,
    /// A single send failed; the channel may still work.
    #[error("send failed: {0}")]
    Send(String),
}

/// The privileged channel toward the relay process.
#[async_trait]
pub trait RelayPort: Send + Sync {
    /// Cheap check whether the relay this port was opened against still exists.
    fn is_valid(&self) -> bool;

    async fn send(&self, envelope: Envelope) -> Result<(), PortError>;
}

/// The channel toward the host page.
#[async_trait]
pub trait HostPort: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> Result<(), PortError>;
}

/// In-process relay port over an mpsc channel. Invalid once the receiver is gone.
pub struct ChannelRelayPort(pub mpsc::Sender<Envelope>);

#[async_trait]
impl RelayPort for ChannelRelayPort {
    fn is_valid(&self) -> bool {
        !self.0.is_closed()
    }

    async fn send(&self, envelope: Envelope) -> Result<(), PortError> {
        self.0
            .send(envelope)
            .await
            .map_err(|_| PortError::Invalidated)
    }
}

/// In-process host port over an mpsc channel.
pub struct ChannelHostPort(pub mpsc::Sender<Envelope>);

#[async_trait]
impl HostPort for ChannelHostPort {
    async fn deliver(&self, envelope: Envelope) -> Result<(), PortError> {
        self.0
            .send(envelope)
            .await
            .map_err(|e| PortError::Send(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub to_relay: u64,
    pub to_host: u64,
    /// Dropped because the relay port was invalidated.
    pub dropped_invalidated: u64,
    /// Dropped because the kind is not allowed in that direction.
    pub rejected_kind: u64,
    pub send_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    to_relay: AtomicU64,
    to_host: AtomicU64,
    dropped_invalidated: AtomicU64,
    rejected_kind: AtomicU64,
    send_failures: AtomicU64,
}

pub struct ContextBridge {
    relay: Arc<dyn RelayPort>,
    host: Arc<dyn HostPort>,
    invalidated: AtomicBool,
    counters: Counters,
}

fn allowed_from_host(kind: &str) -> bool {
    kind == MessageKind::Capture.as_str()
        || kind == MessageKind::CommandResult.as_str()
        || kind == MessageKind::Surfaces.as_str()
}

impl ContextBridge {
    pub fn new(relay: Arc<dyn RelayPort>, host: Arc<dyn HostPort>) -> Self {
        Self {
            relay,
            host,
            invalidated: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    fn invalidate(&self, reason: &str) {
        if !self.invalidated.swap(true, Ordering::AcqRel) {
            tracing::warn!(reason, "relay channel invalidated; dropping further envelopes");
        }
    }

    /// Forward one envelope from the host page toward the relay.
    pub async fn forward_from_host(&self, envelope: Envelope) {
        if !allowed_from_host(&envelope.kind) {
            self.counters.rejected_kind.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kind = %envelope.kind, "host sent envelope kind the bridge does not relay");
            return;
        }
        if self.is_invalidated() {
            self.counters
                .dropped_invalidated
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !self.relay.is_valid() {
            self.invalidate("validity check failed");
            self.counters
                .dropped_invalidated
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.relay.send(envelope).await {
            Ok(()) => {
                self.counters.to_relay.fetch_add(1, Ordering::Relaxed);
            }
            Err(PortError::Invalidated) => {
                self.invalidate("send reported invalidation");
                self.counters
                    .dropped_invalidated
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(PortError::Send(reason)) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%reason, "relay send failed; envelope dropped");
            }
        }
    }

    /// Forward one envelope from the relay toward the host page.
    pub async fn forward_from_relay(&self, envelope: Envelope) {
        if envelope.kind != MessageKind::Command.as_str() {
            self.counters.rejected_kind.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kind = %envelope.kind, "relay sent envelope kind the bridge does not relay");
            return;
        }
        match self.host.deliver(envelope).await {
            Ok(()) => {
                self.counters.to_host.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "host delivery failed; command dropped");
            }
        }
    }

    /// Pump both directions until cancelled or both inputs close.
    ///
    /// Each direction is handled in arrival order; the two directions are
    /// independent of each other.
    pub async fn run(
        &self,
        mut host_rx: mpsc::Receiver<Envelope>,
        mut relay_rx: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) {
        let mut host_open = true;
        let mut relay_open = true;
        while host_open || relay_open {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = host_rx.recv(), if host_open => match next {
                    Some(envelope) => self.forward_from_host(envelope).await,
                    None => host_open = false,
                },
                next = relay_rx.recv(), if relay_open => match next {
                    Some(envelope) => self.forward_from_relay(envelope).await,
                    None => relay_open = false,
                },
            }
        }
        tracing::debug!(stats = ?self.stats(), "bridge loop stopped");
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            to_relay: self.counters.to_relay.load(Ordering::Relaxed),
            to_host: self.counters.to_host.load(Ordering::Relaxed),
            dropped_invalidated: self.counters.dropped_invalidated.load(Ordering::Relaxed),
            rejected_kind: self.counters.rejected_kind.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }
}
