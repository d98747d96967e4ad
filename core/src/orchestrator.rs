//! Active command orchestration.
//!
//! Issues fetch commands into a host page through the bridge and correlates
//! the asynchronous replies by command id. Each command carries its own
//! deadline; resolution and timeout race through a [`PendingRegistry`], so
//! exactly one of them settles the caller and a late result is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagetap_async_utils::{DeferredError, PendingRegistry};
use pagetap_protocol::{CommandAction, CommandId, CommandRequest, CommandResult, SurfaceId};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no eligible target surface")]
    NoEligibleSurface,

    #[error("surface {0} is not eligible")]
    SurfaceNotEligible(SurfaceId),

    #[error("command {command_id} timed out after {after:?}")]
    Timeout {
        command_id: CommandId,
        after: Duration,
    },

    #[error("command {command_id} could not be dispatched: {reason}")]
    Transport {
        command_id: CommandId,
        reason: String,
    },

    #[error("command {0} was cancelled")]
    Cancelled(CommandId),
}

/// Enumerates the surfaces that can currently execute commands.
#[async_trait]
pub trait TargetSurfaces: Send + Sync {
    async fn eligible(&self) -> Vec<SurfaceId>;
}

/// Carries a command across the bridge toward the host page.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn dispatch(&self, request: CommandRequest) -> Result<(), String>;
}

/// Metadata kept for each outstanding command.
#[derive(Debug, Clone, Serialize)]
pub struct PendingCommand {
    pub command_id: CommandId,
    pub surface: SurfaceId,
    pub action: CommandAction,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    issued: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
    late: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub issued: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub late_results: u64,
}

pub struct CommandOrchestrator {
    surfaces: Arc<dyn TargetSurfaces>,
    transport: Arc<dyn CommandTransport>,
    pending: PendingRegistry<CommandId, CommandResult, PendingCommand>,
    timeout: Duration,
    counters: Counters,
}

impl CommandOrchestrator {
    pub fn new(
        surfaces: Arc<dyn TargetSurfaces>,
        transport: Arc<dyn CommandTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            surfaces,
            transport,
            pending: PendingRegistry::new(),
            timeout,
            counters: Counters::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue `action` to `target`, or to the first eligible surface.
    pub async fn issue_command(
        &self,
        target: Option<SurfaceId>,
        action: CommandAction,
    ) -> Result<CommandResult, CommandError> {
        let eligible = self.surfaces.eligible().await;
        let surface = match target {
            Some(surface) if eligible.contains(&surface) => surface,
            Some(surface) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(CommandError::SurfaceNotEligible(surface));
            }
            None => match eligible.into_iter().next() {
                Some(surface) => surface,
                None => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(CommandError::NoEligibleSurface);
                }
            },
        };

        let command_id = CommandId::generate();
        let created_at = Utc::now();
        let deadline = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(created_at);
        let meta = PendingCommand {
            command_id: command_id.clone(),
            surface: surface.clone(),
            action: action.clone(),
            created_at,
            deadline,
        };
        let deferred = self
            .pending
            .register(command_id.clone(), meta, self.timeout)
            .map_err(|_| CommandError::Transport {
                command_id: command_id.clone(),
                reason: "duplicate command id".to_string(),
            })?;
        self.counters.issued.fetch_add(1, Ordering::Relaxed);

        let request = CommandRequest {
            command_id: command_id.clone(),
            surface: surface.clone(),
            action,
        };
        tracing::debug!(
            command_id = %command_id,
            surface = %surface,
            action = request.action.name(),
            "issuing command"
        );
        if let Err(reason) = self.transport.dispatch(request).await {
            // Dropping the deferred removes its pending entry.
            drop(deferred);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(command_id = %command_id, %reason, "command dispatch failed");
            return Err(CommandError::Transport { command_id, reason });
        }

        match deferred.wait().await {
            Ok(result) => {
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(DeferredError::TimedOut(after)) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(command_id = %command_id, ?after, "command timed out");
                Err(CommandError::Timeout { command_id, after })
            }
            Err(DeferredError::Cancelled) => Err(CommandError::Cancelled(command_id)),
        }
    }

    /// Hand a result to its waiting command. Returns `false` when no command
    /// is waiting on that id (unknown, already settled, or timed out).
    pub fn accept_command_result(&self, result: CommandResult) -> bool {
        let command_id = result.command_id.clone();
        if self.pending.resolve(&command_id, result) {
            return true;
        }
        self.counters.late.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(command_id = %command_id, "discarding result with no pending command");
        false
    }

    /// Outstanding commands, earliest deadline first.
    pub fn pending(&self) -> Vec<PendingCommand> {
        self.pending.pending().into_iter().map(|p| p.meta).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            issued: self.counters.issued.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            late_results: self.counters.late.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FixedSurfaces(Vec<SurfaceId>);

    #[async_trait]
    impl TargetSurfaces for FixedSurfaces {
        async fn eligible(&self) -> Vec<SurfaceId> {
            self.0.clone()
        }
    }

    struct ChannelTransport(mpsc::UnboundedSender<CommandRequest>);

    #[async_trait]
    impl CommandTransport for ChannelTransport {
        async fn dispatch(&self, request: CommandRequest) -> Result<(), String> {
            self.0.send(request).map_err(|e| e.to_string())
        }
    }

    struct FailingTransport(Mutex<u32>);

    #[async_trait]
    impl CommandTransport for FailingTransport {
        async fn dispatch(&self, _request: CommandRequest) -> Result<(), String> {
            *self.0.lock().unwrap() += 1;
            Err("bridge gone".to_string())
        }
    }

    fn orchestrator(
        surfaces: &[&str],
        timeout: Duration,
    ) -> (Arc<CommandOrchestrator>, mpsc::UnboundedReceiver<CommandRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = CommandOrchestrator::new(
            Arc::new(FixedSurfaces(surfaces.iter().map(|s| SurfaceId::new(*s)).collect())),
            Arc::new(ChannelTransport(tx)),
            timeout,
        );
        (Arc::new(orchestrator), rx)
    }

    #[tokio::test]
    async fn resolves_with_matching_result() {
        let (orch, mut rx) = orchestrator(&["page-1"], Duration::from_secs(5));
        let issuing = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.issue_command(None, CommandAction::fetch("/api/x")).await })
        };

        let request = rx.recv().await.unwrap();
        assert_eq!(request.surface, SurfaceId::new("page-1"));
        assert_eq!(orch.pending_count(), 1);

        let result = CommandResult::ok(request.command_id.clone(), json!({"v": 1}));
        assert!(orch.accept_command_result(result.clone()));
        assert_eq!(issuing.await.unwrap().unwrap(), result);

        // A duplicate reply has no effect.
        assert!(!orch.accept_command_result(result));
        assert_eq!(orch.pending_count(), 0);
        assert_eq!(orch.stats().resolved, 1);
        assert_eq!(orch.stats().late_results, 1);
    }

    #[tokio::test]
    async fn times_out_once_and_discards_late_result() {
        let (orch, mut rx) = orchestrator(&["page-1"], Duration::from_millis(30));
        let outcome = orch.issue_command(None, CommandAction::Ping).await;
        let request = rx.recv().await.unwrap();

        assert!(matches!(
            outcome,
            Err(CommandError::Timeout { ref command_id, .. }) if *command_id == request.command_id
        ));
        assert_eq!(orch.pending_count(), 0);
        assert!(!orch.accept_command_result(CommandResult::ok(request.command_id, json!(null))));
        assert_eq!(orch.stats().timed_out, 1);
        assert_eq!(orch.stats().resolved, 0);
    }

    #[tokio::test]
    async fn rejects_without_surfaces_and_creates_nothing() {
        let (orch, mut rx) = orchestrator(&[], Duration::from_secs(5));
        let outcome = orch.issue_command(None, CommandAction::Ping).await;
        assert!(matches!(outcome, Err(CommandError::NoEligibleSurface)));
        assert_eq!(orch.pending_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_ineligible_named_surface() {
        let (orch, _rx) = orchestrator(&["page-1"], Duration::from_secs(5));
        let outcome = orch
            .issue_command(Some(SurfaceId::new("page-2")), CommandAction::Ping)
            .await;
        assert!(matches!(outcome, Err(CommandError::SurfaceNotEligible(s)) if s.as_str() == "page-2"));
        assert_eq!(orch.pending_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_failure_clears_pending_entry() {
        let transport = Arc::new(FailingTransport(Mutex::new(0)));
        let orch = CommandOrchestrator::new(
            Arc::new(FixedSurfaces(vec![SurfaceId::new("p")])),
            transport.clone(),
            Duration::from_secs(5),
        );
        let outcome = orch.issue_command(None, CommandAction::Ping).await;
        assert!(matches!(outcome, Err(CommandError::Transport { .. })));
        assert_eq!(orch.pending_count(), 0);
        assert_eq!(*transport.0.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn independent_deadlines() {
        let (orch, mut rx) = orchestrator(&["p"], Duration::from_millis(200));
        let slow = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.issue_command(None, CommandAction::Ping).await })
        };
        let fast = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.issue_command(None, CommandAction::fetch("/a")).await })
        };

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let to_answer = if matches!(first.action, CommandAction::FetchJson { .. }) {
            first
        } else {
            second
        };
        assert!(orch.accept_command_result(CommandResult::ok(to_answer.command_id, json!(1))));

        assert!(fast.await.unwrap().is_ok());
        assert!(matches!(slow.await.unwrap(), Err(CommandError::Timeout { .. })));
    }
}
