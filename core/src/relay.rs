//! The relay process: owner of all long-lived pipeline state.
//!
//! Everything mutable on the relay side lives here: the endpoint registry,
//! the delivery queue, outstanding commands, the eligible surfaces last
//! reported by the bridge, the backend connection state and the pipeline
//! counters. Other components reach that state only through these
//! operations. The backend client, the command transport and the classifier
//! are injected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagetap_async_utils::sleep_or_cancel;
use pagetap_protocol::ingest::IngestRecord;
use pagetap_protocol::{
    BridgeMessage, Capture, CaptureCounters, CommandAction, CommandResult, ConnectionState,
    DataCategory, EndpointPattern, Envelope, MessageKind, StatusSnapshot, SurfaceId,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendClient, BackendSink, HttpBackend};
use crate::config::PagetapConfig;
use crate::connection::ConnectionMonitor;
use crate::delegator::TaskDelegator;
use crate::error::{PipelineError, Result};
use crate::normalize::normalize;
use crate::orchestrator::{CommandOrchestrator, CommandTransport, PendingCommand, TargetSurfaces};
use crate::queue::{DeliveryQueue, DrainReport, EnqueueOutcome, OverflowPolicy, QueueEntry};
use crate::registry::{EndpointRegistry, Observation, RegistryStore};

/// The parts of [`PagetapConfig`] the relay consults at runtime.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub command_timeout: Duration,
    pub health_interval: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &PagetapConfig) -> Self {
        Self {
            queue_capacity: config.queue.capacity,
            overflow: config.queue.overflow,
            command_timeout: config.commands.timeout(),
            health_interval: config.backend.health_interval(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&PagetapConfig::default())
    }
}

/// Injected collaborators.
pub struct RelayDeps {
    pub backend: Arc<dyn BackendClient>,
    pub transport: Arc<dyn CommandTransport>,
    pub delegator: Arc<TaskDelegator>,
    pub registry: EndpointRegistry,
}

/// Surfaces the bridge last reported as able to run commands.
#[derive(Debug, Default)]
pub struct SurfaceBook {
    surfaces: RwLock<Vec<SurfaceId>>,
}

impl SurfaceBook {
    pub fn replace(&self, surfaces: Vec<SurfaceId>) {
        let mut current = self
            .surfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = surfaces;
    }

    pub fn list(&self) -> Vec<SurfaceId> {
        self.surfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TargetSurfaces for SurfaceBook {
    async fn eligible(&self) -> Vec<SurfaceId> {
        self.list()
    }
}

/// How a recorded capture left the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    /// Sent straight to the backend.
    Direct,
    /// Buffered for the next drain.
    Queued,
    /// Buffered after evicting the oldest entry.
    QueuedEvictedOldest,
    /// The queue was full and refused it.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureReceipt {
    pub endpoint: String,
    pub data_category: DataCategory,
    pub discovered: bool,
    pub delivery: DeliveryPath,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainReport>,
    pub registry_flushed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    captures_received: AtomicU64,
    captures_malformed: AtomicU64,
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

pub struct RelayProcess {
    instance_id: String,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    settings: RelaySettings,
    registry: Mutex<EndpointRegistry>,
    /// Held while a registry document is written so writes land in order.
    registry_writes: tokio::sync::Mutex<()>,
    queue: DeliveryQueue<IngestRecord>,
    surfaces: Arc<SurfaceBook>,
    orchestrator: CommandOrchestrator,
    delegator: Arc<TaskDelegator>,
    connection: ConnectionMonitor,
    backend: Arc<dyn BackendClient>,
    counters: Counters,
}

impl RelayProcess {
    pub fn new(settings: RelaySettings, deps: RelayDeps) -> Self {
        let surfaces = Arc::new(SurfaceBook::default());
        let orchestrator = CommandOrchestrator::new(
            Arc::clone(&surfaces) as Arc<dyn TargetSurfaces>,
            deps.transport,
            settings.command_timeout,
        );
        let instance_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(%instance_id, "relay process created");
        Self {
            instance_id,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            queue: DeliveryQueue::new(settings.queue_capacity, settings.overflow),
            settings,
            registry: Mutex::new(deps.registry),
            registry_writes: tokio::sync::Mutex::new(()),
            surfaces,
            orchestrator,
            delegator: deps.delegator,
            connection: ConnectionMonitor::new(),
            backend: deps.backend,
            counters: Counters::default(),
        }
    }

    /// Wire up the production collaborators from configuration.
    pub fn from_config(
        config: &PagetapConfig,
        transport: Arc<dyn CommandTransport>,
    ) -> Result<Self> {
        let backend = HttpBackend::new(&config.backend)?;
        let registry = EndpointRegistry::open(RegistryStore::new(config.registry.resolved_path()));
        Ok(Self::new(
            RelaySettings::from_config(config),
            RelayDeps {
                backend: Arc::new(backend),
                transport,
                delegator: Arc::new(TaskDelegator::from_config(&config.classifier)),
                registry,
            },
        ))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_wall
    }

    pub fn connection(&self) -> &ConnectionMonitor {
        &self.connection
    }

    fn registry(&self) -> MutexGuard<'_, EndpointRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize under the registry lock, write on the blocking pool.
    async fn flush_registry(&self, trigger: &'static str) -> bool {
        let _writing = self.registry_writes.lock().await;
        let taken = self.registry().take_write();
        let write = match taken {
            Ok(Some(write)) => write,
            Ok(None) => return false,
            Err(e) => {
                self.note_flush_failure(trigger, PipelineError::from(e));
                return false;
            }
        };
        let endpoints = write.endpoints();
        match tokio::task::spawn_blocking(move || write.commit()).await {
            Ok(Ok(())) => {
                tracing::debug!(endpoints, trigger, "endpoint registry flushed");
                true
            }
            Ok(Err(e)) => {
                self.registry().mark_dirty();
                self.note_flush_failure(trigger, PipelineError::from(e));
                false
            }
            Err(e) => {
                self.registry().mark_dirty();
                tracing::warn!(trigger, error = %e, "registry flush task failed");
                false
            }
        }
    }

    fn note_flush_failure(&self, trigger: &'static str, err: PipelineError) {
        tracing::warn!(category = %err.category(), trigger, error = %err, "registry flush failed");
    }

    fn spawn_flush(self: &Arc<Self>, trigger: &'static str) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            relay.flush_registry(trigger).await;
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound envelopes
    // ─────────────────────────────────────────────────────────────────────────

    /// Open an envelope received from the bridge and route it.
    pub async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        let message = self.open_envelope(envelope)?;
        self.handle_message(message).await
    }

    /// Validate an envelope. Failures count as malformed captures.
    pub fn open_envelope(&self, envelope: Envelope) -> Result<BridgeMessage> {
        envelope.open().map_err(|e| {
            self.counters
                .captures_malformed
                .fetch_add(1, Ordering::Relaxed);
            let err = PipelineError::from(e);
            tracing::debug!(category = %err.category(), error = %err, "dropping envelope");
            err
        })
    }

    pub async fn handle_message(self: &Arc<Self>, message: BridgeMessage) -> Result<()> {
        match message {
            BridgeMessage::Capture(capture) => self.record_capture(capture).await.map(|_| ()),
            BridgeMessage::CommandResult(result) => {
                self.accept_command_result(result);
                Ok(())
            }
            BridgeMessage::Surfaces(surfaces) => {
                self.set_surfaces(surfaces);
                Ok(())
            }
            BridgeMessage::Command(_) => Err(PipelineError::UnexpectedMessage(MessageKind::Command)),
        }
    }

    /// Replace the surfaces commands may be routed to.
    pub fn set_surfaces(&self, surfaces: Vec<SurfaceId>) {
        tracing::debug!(count = surfaces.len(), "eligible surfaces updated");
        self.surfaces.replace(surfaces);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Captures
    // ─────────────────────────────────────────────────────────────────────────

    /// Normalize, classify, register and forward one capture.
    pub async fn record_capture(self: &Arc<Self>, capture: Capture) -> Result<CaptureReceipt> {
        self.counters
            .captures_received
            .fetch_add(1, Ordering::Relaxed);

        let endpoint = match normalize(&capture.url) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.counters
                    .captures_malformed
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(url = %capture.url, error = %e, "capture url could not be normalized");
                return Err(PipelineError::MalformedCapture(e.to_string()));
            }
        };

        let classification = self.delegator.classify(&capture).await;
        let observation = self
            .registry()
            .observe(&endpoint, &capture, classification.data_category);
        let discovered = observation.is_discovery();
        if discovered {
            self.spawn_flush("discovery");
            self.spawn_schema_inference(&observation, &capture);
        }
        tracing::debug!(
            key = %endpoint.key,
            category = %classification.data_category,
            source = ?classification.source,
            "capture recorded"
        );

        let record = IngestRecord::from_capture(
            &capture,
            endpoint.key.clone(),
            classification.data_category,
        )
        .with_delegate(classification.delegate_to);
        let delivery = self.deliver(record).await;

        Ok(CaptureReceipt {
            endpoint: endpoint.key,
            data_category: classification.data_category,
            discovered,
            delivery,
        })
    }

    fn spawn_schema_inference(self: &Arc<Self>, observation: &Observation, capture: &Capture) {
        if !self.delegator.has_external() {
            return;
        }
        let relay = Arc::clone(self);
        let key = observation.key().to_string();
        let capture = capture.clone();
        tokio::spawn(async move {
            let Some(schema) = relay.delegator.infer_schema(&capture).await else {
                return;
            };
            if relay.registry().set_schema(&key, schema) {
                tracing::debug!(%key, "schema inferred");
                relay.flush_registry("schema").await;
            }
        });
    }

    /// Send directly while connected with nothing buffered; buffer otherwise
    /// so queued records keep their order ahead of new ones.
    async fn deliver(&self, record: IngestRecord) -> DeliveryPath {
        if self.connection.state().is_connected() && self.queue.is_empty() {
            match self.backend.ingest(&record).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return DeliveryPath::Direct;
                }
                Err(e) => {
                    self.counters
                        .delivery_failures
                        .fetch_add(1, Ordering::Relaxed);
                    let err = PipelineError::from(e);
                    tracing::warn!(category = %err.category(), error = %err, "direct delivery failed, buffering");
                    self.connection
                        .set(ConnectionState::Error, "direct delivery failed");
                }
            }
        }
        match self.queue.enqueue(record) {
            Ok(EnqueueOutcome::Queued) => DeliveryPath::Queued,
            Ok(EnqueueOutcome::QueuedEvictedOldest) => DeliveryPath::QueuedEvictedOldest,
            Err(_) => DeliveryPath::Rejected,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn issue_command(
        &self,
        target: Option<SurfaceId>,
        action: CommandAction,
    ) -> Result<CommandResult> {
        Ok(self.orchestrator.issue_command(target, action).await?)
    }

    /// Returns `false` for results nobody is waiting on.
    pub fn accept_command_result(&self, result: CommandResult) -> bool {
        self.orchestrator.accept_command_result(result)
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.orchestrator.pending()
    }

    pub fn surfaces(&self) -> Vec<SurfaceId> {
        self.surfaces.list()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery, health and status
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn drain_queue(&self) -> DrainReport {
        let report = self.queue.drain(&BackendSink(self.backend.as_ref())).await;
        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        if let Some(reason) = &report.failed {
            self.counters
                .delivery_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%reason, remaining = report.remaining, "queue drain stopped");
            self.connection.set(ConnectionState::Error, "drain failed");
        } else if report.delivered > 0 {
            tracing::info!(delivered = report.delivered, "queue drained");
        }
        report
    }

    pub fn queued(&self) -> Vec<QueueEntry<IngestRecord>> {
        self.queue.snapshot()
    }

    /// One health-check cycle: probe, update the state, drain when
    /// reachable, then flush the registry if it changed.
    pub async fn health_tick(&self) -> HealthReport {
        if !self.connection.state().is_connected() {
            self.connection
                .set(ConnectionState::Connecting, "health probe");
        }
        let drain = match self.backend.health().await {
            Ok(()) => {
                self.connection
                    .set(ConnectionState::Connected, "health probe ok");
                if self.queue.is_empty() {
                    None
                } else {
                    Some(self.drain_queue().await)
                }
            }
            Err(e) => {
                let err = PipelineError::from(e);
                tracing::debug!(category = %err.category(), error = %err, "health probe failed");
                self.connection
                    .set(ConnectionState::Error, "health probe failed");
                None
            }
        };
        let registry_flushed = self.flush_registry("health tick").await;
        HealthReport {
            state: self.connection.state(),
            drain,
            registry_flushed,
        }
    }

    /// Run [`Self::health_tick`] on the configured interval until cancelled,
    /// then flush state.
    pub async fn run_health_loop(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(interval = ?self.settings.health_interval, "health loop started");
        loop {
            self.health_tick().await;
            if !sleep_or_cancel(self.settings.health_interval, &cancel).await {
                break;
            }
        }
        self.shutdown().await;
    }

    /// Flush the registry. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.flush_registry("shutdown").await;
        tracing::info!(
            queued = self.queue.len(),
            pending_commands = self.orchestrator.pending_count(),
            "relay stopped"
        );
    }

    pub fn registry_list(&self) -> Vec<EndpointPattern> {
        self.registry().list()
    }

    pub fn status(&self) -> StatusSnapshot {
        let commands = self.orchestrator.stats();
        StatusSnapshot {
            instance_id: self.instance_id.clone(),
            connection_state: self.connection.state(),
            counters: CaptureCounters {
                captures_received: self.counters.captures_received.load(Ordering::Relaxed),
                captures_malformed: self.counters.captures_malformed.load(Ordering::Relaxed),
                delivered: self.counters.delivered.load(Ordering::Relaxed),
                delivery_failures: self.counters.delivery_failures.load(Ordering::Relaxed),
                commands_issued: commands.issued,
                commands_resolved: commands.resolved,
                commands_timed_out: commands.timed_out,
                commands_rejected: commands.rejected,
                late_results_discarded: commands.late_results,
                classifier_fallbacks: self.delegator.fallbacks(),
            },
            endpoints: self.registry().len(),
            queue_depth: self.queue.len(),
            queue_dropped: self.queue.dropped(),
            pending_commands: self.orchestrator.pending_count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::delegator::RuleClassifier;
    use pagetap_protocol::{CommandId, CommandRequest, SourceChannel};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    /// Backend double: stores ingested records, can be switched off.
    #[derive(Default)]
    struct FakeBackend {
        up: AtomicBool,
        ingested: Mutex<Vec<IngestRecord>>,
    }

    impl FakeBackend {
        fn endpoints(&self) -> Vec<String> {
            self.ingested
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.url.clone())
                .collect()
        }
    }

    #[async_trait]
    impl BackendClient for FakeBackend {
        async fn ingest(&self, record: &IngestRecord) -> std::result::Result<(), BackendError> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(BackendError::Unreachable("down".to_string()));
            }
            self.ingested.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn health(&self) -> std::result::Result<(), BackendError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BackendError::Unreachable("down".to_string()))
            }
        }
    }

    struct ChannelTransport(mpsc::UnboundedSender<CommandRequest>);

    #[async_trait]
    impl CommandTransport for ChannelTransport {
        async fn dispatch(&self, request: CommandRequest) -> std::result::Result<(), String> {
            self.0.send(request).map_err(|e| e.to_string())
        }
    }

    fn relay(
        backend: Arc<FakeBackend>,
        settings: RelaySettings,
    ) -> (Arc<RelayProcess>, mpsc::UnboundedReceiver<CommandRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = RelayProcess::new(
            settings,
            RelayDeps {
                backend,
                transport: Arc::new(ChannelTransport(tx)),
                delegator: Arc::new(TaskDelegator::rules_only(RuleClassifier::default())),
                registry: EndpointRegistry::in_memory(),
            },
        );
        (Arc::new(relay), rx)
    }

    fn capture(url: &str) -> Capture {
        Capture::new(
            SourceChannel::PrimaryHook,
            "GET",
            url,
            200,
            json!({"medications": [{"name": "x"}]}),
        )
    }

    #[tokio::test]
    async fn buffers_while_disconnected_and_drains_in_order_on_health() {
        let backend = Arc::new(FakeBackend::default());
        let (relay, _rx) = relay(Arc::clone(&backend), RelaySettings::default());

        for n in 1..=3 {
            let receipt = relay
                .record_capture(capture(&format!("https://h/chart/{n}/medications")))
                .await
                .unwrap();
            assert_eq!(receipt.delivery, DeliveryPath::Queued);
            assert_eq!(receipt.endpoint, "h/chart/{id}/medications");
            assert_eq!(receipt.discovered, n == 1);
        }
        assert_eq!(relay.status().queue_depth, 3);

        let report = relay.health_tick().await;
        assert_eq!(report.state, ConnectionState::Error);
        assert!(report.drain.is_none());

        backend.up.store(true, Ordering::SeqCst);
        let report = relay.health_tick().await;
        assert_eq!(report.state, ConnectionState::Connected);
        assert_eq!(report.drain.map(|d| d.delivered), Some(3));
        assert_eq!(
            backend.endpoints(),
            vec![
                "https://h/chart/1/medications",
                "https://h/chart/2/medications",
                "https://h/chart/3/medications",
            ]
        );

        // Connected with an empty queue: straight through.
        let receipt = relay
            .record_capture(capture("https://h/chart/4/medications"))
            .await
            .unwrap();
        assert_eq!(receipt.delivery, DeliveryPath::Direct);

        let status = relay.status();
        assert_eq!(status.counters.captures_received, 4);
        assert_eq!(status.counters.delivered, 4);
        assert_eq!(status.endpoints, 1);
        assert_eq!(relay.registry_list()[0].use_count, 4);
    }

    #[tokio::test]
    async fn failed_direct_send_falls_back_to_queue() {
        let backend = Arc::new(FakeBackend::default());
        backend.up.store(true, Ordering::SeqCst);
        let (relay, _rx) = relay(Arc::clone(&backend), RelaySettings::default());
        relay.health_tick().await;

        backend.up.store(false, Ordering::SeqCst);
        let receipt = relay
            .record_capture(capture("https://h/api/labs"))
            .await
            .unwrap();
        assert_eq!(receipt.delivery, DeliveryPath::Queued);
        assert_eq!(relay.connection().state(), ConnectionState::Error);
        assert_eq!(relay.status().counters.delivery_failures, 1);
    }

    #[tokio::test]
    async fn reject_new_policy_reports_rejection() {
        let backend = Arc::new(FakeBackend::default());
        let settings = RelaySettings {
            queue_capacity: 1,
            overflow: OverflowPolicy::RejectNew,
            ..RelaySettings::default()
        };
        let (relay, _rx) = relay(backend, settings);
        relay.record_capture(capture("https://h/a")).await.unwrap();
        let receipt = relay.record_capture(capture("https://h/b")).await.unwrap();
        assert_eq!(receipt.delivery, DeliveryPath::Rejected);
        assert_eq!(relay.status().queue_dropped, 1);
    }

    #[tokio::test]
    async fn malformed_envelopes_are_counted_and_dropped() {
        let (relay, _rx) = relay(Arc::new(FakeBackend::default()), RelaySettings::default());
        let bad = Envelope {
            kind: "capture".to_string(),
            version: pagetap_protocol::ENVELOPE_VERSION,
            payload: json!({"method": "GET"}),
        };
        let err = relay.handle_envelope(bad).await.unwrap_err();
        assert_eq!(err.category().as_str(), "MALFORMED_CAPTURE");

        let unknown = Envelope {
            kind: "telemetry".to_string(),
            version: pagetap_protocol::ENVELOPE_VERSION,
            payload: json!({}),
        };
        assert!(relay.handle_envelope(unknown).await.is_err());
        assert_eq!(relay.status().counters.captures_malformed, 2);
        assert_eq!(relay.status().endpoints, 0);
    }

    #[tokio::test]
    async fn commands_route_through_reported_surfaces() {
        let (relay, mut rx) = relay(Arc::new(FakeBackend::default()), RelaySettings::default());

        let err = relay
            .issue_command(None, CommandAction::Ping)
            .await
            .unwrap_err();
        assert_eq!(err.category().as_str(), "COMMAND_REJECTED");
        assert_eq!(relay.pending_commands().len(), 0);

        relay
            .handle_envelope(BridgeMessage::Surfaces(vec![SurfaceId::new("tab-1")]).seal())
            .await
            .unwrap();

        let issuer = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move {
                relay
                    .issue_command(None, CommandAction::fetch("/api/x"))
                    .await
            })
        };
        let request = rx.recv().await.unwrap();
        assert_eq!(request.surface, SurfaceId::new("tab-1"));

        let result = CommandResult::ok(request.command_id.clone(), json!({"x": 1}));
        relay
            .handle_envelope(BridgeMessage::CommandResult(result).seal())
            .await
            .unwrap();
        let resolved = issuer.await.unwrap().unwrap();
        assert_eq!(resolved.data, Some(json!({"x": 1})));

        // Same id again: nobody is waiting.
        assert!(!relay.accept_command_result(CommandResult::ok(request.command_id, json!({}))));
        assert!(!relay.accept_command_result(CommandResult::ok(CommandId::from("nope"), json!({}))));
        let counters = relay.status().counters;
        assert_eq!(counters.commands_resolved, 1);
        assert_eq!(counters.late_results_discarded, 2);
        assert_eq!(counters.commands_rejected, 1);
    }

    #[tokio::test]
    async fn command_envelopes_from_bridge_are_refused() {
        let (relay, _rx) = relay(Arc::new(FakeBackend::default()), RelaySettings::default());
        let envelope = BridgeMessage::Command(CommandRequest {
            command_id: CommandId::from("c"),
            surface: SurfaceId::new("p"),
            action: CommandAction::Ping,
        })
        .seal();
        assert!(matches!(
            relay.handle_envelope(envelope).await,
            Err(PipelineError::UnexpectedMessage(MessageKind::Command))
        ));
    }

    #[tokio::test]
    async fn discovery_flushes_registry_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endpoints.json");
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = Arc::new(RelayProcess::new(
            RelaySettings::default(),
            RelayDeps {
                backend: Arc::new(FakeBackend::default()),
                transport: Arc::new(ChannelTransport(tx)),
                delegator: Arc::new(TaskDelegator::rules_only(RuleClassifier::default())),
                registry: EndpointRegistry::open(RegistryStore::new(&path)),
            },
        ));
        relay
            .record_capture(capture("https://h/data?sources=allergies&chart_id=5"))
            .await
            .unwrap();

        // The discovery write runs in the background.
        let mut stored = Vec::new();
        for _ in 0..100 {
            stored = RegistryStore::new(&path).load().unwrap();
            if !stored.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].normalized_key, "h/data");

        relay
            .record_capture(capture("https://h/data?sources=allergies&chart_id=9"))
            .await
            .unwrap();
        relay.shutdown().await;
        let stored = RegistryStore::new(&path).load().unwrap();
        assert_eq!(stored[0].use_count, 2);
    }

    #[tokio::test]
    async fn health_loop_stops_on_cancel() {
        let backend = Arc::new(FakeBackend::default());
        backend.up.store(true, Ordering::SeqCst);
        let settings = RelaySettings {
            health_interval: Duration::from_millis(10),
            ..RelaySettings::default()
        };
        let (relay, _rx) = relay(backend, settings);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&relay).run_health_loop(cancel.clone()));
        let mut states = relay.connection().subscribe();
        states
            .wait_for(|state| state.is_connected())
            .await
            .unwrap();
        cancel.cancel();
        handle.await.unwrap();
    }
}
