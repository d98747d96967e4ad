//! Unix domain socket listener for the relay.
//!
//! Accepts connections, reads newline-delimited JSON-RPC-lite messages and
//! dispatches them to the [`RelayProcess`]. Bridge connections additionally
//! receive `bridge.command` notifications through the [`BridgeHub`].
//!
//! Captures a bridge sends as notifications are recorded by a per-connection
//! worker in arrival order. Command results and surface reports bypass that
//! worker, so a slow backend ingest never delays a command's answer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pagetap_async_utils::OrCancelExt;
use pagetap_core::orchestrator::CommandError;
use pagetap_core::{CommandTransport, PipelineError, RelayProcess};
use pagetap_protocol::jsonrpc::{
    RequestId, RpcError, RpcMessage, RpcNotification, RpcRequest, RpcResponse, encode_line,
};
use pagetap_protocol::{BridgeMessage, Capture, CommandRequest, Envelope, SurfaceId};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::PROTOCOL_VERSION;
use crate::protocol::*;

/// Lines buffered per connection before writers wait.
const OUTBOUND_BUFFER: usize = 256;

/// Notified captures waiting for the connection's capture worker.
const CAPTURE_BUFFER: usize = 256;

type RpcResult = Result<Value, (i64, String)>;

// ─────────────────────────────────────────────────────────────────────────────
// Bridge hub
// ─────────────────────────────────────────────────────────────────────────────

struct BridgeSlot {
    outbound: mpsc::Sender<Vec<u8>>,
    surfaces: Vec<SurfaceId>,
}

/// Connected bridges and the surfaces each one reported.
///
/// Implements [`CommandTransport`] by pushing the command to whichever
/// bridge owns the target surface.
#[derive(Default)]
pub struct BridgeHub {
    next_connection: AtomicU64,
    bridges: Mutex<HashMap<u64, BridgeSlot>>,
}

impl BridgeHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn bridges(&self) -> MutexGuard<'_, HashMap<u64, BridgeSlot>> {
        self.bridges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn register(&self, connection: u64, outbound: mpsc::Sender<Vec<u8>>) {
        self.bridges().insert(
            connection,
            BridgeSlot {
                outbound,
                surfaces: Vec::new(),
            },
        );
        tracing::info!(connection, "bridge registered");
    }

    /// Record `connection`'s surfaces. `None` when it never registered.
    fn set_surfaces(&self, connection: u64, surfaces: Vec<SurfaceId>) -> Option<Vec<SurfaceId>> {
        let mut bridges = self.bridges();
        bridges.get_mut(&connection)?.surfaces = surfaces;
        Some(union(&bridges))
    }

    /// Forget `connection`. `None` when it was not a bridge.
    fn remove(&self, connection: u64) -> Option<Vec<SurfaceId>> {
        let mut bridges = self.bridges();
        bridges.remove(&connection)?;
        tracing::info!(connection, "bridge disconnected");
        Some(union(&bridges))
    }

    /// Every reported surface, ordered by connection then report order.
    pub fn surfaces(&self) -> Vec<SurfaceId> {
        union(&self.bridges())
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges().len()
    }
}

fn union(bridges: &HashMap<u64, BridgeSlot>) -> Vec<SurfaceId> {
    let mut connections: Vec<_> = bridges.iter().collect();
    connections.sort_by_key(|(id, _)| **id);
    let mut out: Vec<SurfaceId> = Vec::new();
    for (_, slot) in connections {
        for surface in &slot.surfaces {
            if !out.contains(surface) {
                out.push(surface.clone());
            }
        }
    }
    out
}

#[async_trait]
impl CommandTransport for BridgeHub {
    async fn dispatch(&self, request: CommandRequest) -> Result<(), String> {
        let outbound = self
            .bridges()
            .values()
            .find(|slot| slot.surfaces.contains(&request.surface))
            .map(|slot| slot.outbound.clone())
            .ok_or_else(|| format!("no bridge owns surface {}", request.surface))?;
        let params = BridgeEnvelopeParams {
            envelope: BridgeMessage::Command(request).seal(),
        };
        let params = serde_json::to_value(params).map_err(|e| e.to_string())?;
        let line = encode_line(&RpcNotification {
            method: NOTIFY_BRIDGE_COMMAND.to_string(),
            params: Some(params),
        });
        outbound
            .send(line)
            .await
            .map_err(|_| "bridge connection closed".to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// What a socket connection can reach.
pub struct RelayService {
    relay: Arc<RelayProcess>,
    hub: Arc<BridgeHub>,
}

impl RelayService {
    /// `hub` must be the transport `relay` was built with.
    pub fn new(relay: Arc<RelayProcess>, hub: Arc<BridgeHub>) -> Self {
        Self { relay, hub }
    }

    pub fn relay(&self) -> &Arc<RelayProcess> {
        &self.relay
    }

    pub fn hub(&self) -> &Arc<BridgeHub> {
        &self.hub
    }
}

/// One accepted connection.
#[derive(Clone)]
struct Session {
    id: u64,
    outbound: mpsc::Sender<Vec<u8>>,
    captures: mpsc::Sender<Capture>,
}

impl Session {
    async fn send(&self, value: &Value) {
        if self.outbound.send(encode_line(value)).await.is_err() {
            tracing::debug!(connection = self.id, "dropping reply for closed connection");
        }
    }
}

/// Record captures for one connection, one at a time, until every sender
/// is gone.
fn spawn_capture_worker(
    relay: Arc<RelayProcess>,
    connection: u64,
) -> (mpsc::Sender<Capture>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Capture>(CAPTURE_BUFFER);
    let handle = tokio::spawn(async move {
        while let Some(capture) = rx.recv().await {
            if let Err(e) = relay.record_capture(capture).await {
                tracing::debug!(connection, error = %e, "capture not recorded");
            }
        }
    });
    (tx, handle)
}

/// Remove a stale socket file, create the parent directory, and bind.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("relay listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until `cancel` fires.
pub async fn serve(
    service: Arc<RelayService>,
    listener: UnixListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let accepted = match listener.accept().or_cancel(&cancel).await {
            Ok(accepted) => accepted,
            Err(_) => break,
        };
        match accepted {
            Ok((stream, _addr)) => {
                let service = Arc::clone(&service);
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(service, stream, cancel).await {
                        tracing::warn!("Connection error: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {e}");
            }
        }
    }
    tracing::info!("relay socket closed");
    Ok(())
}

/// Handle a single connection.
///
/// Requests other than `hello` run in their own task so a slow
/// `command.issue` does not hold up the connection. Notifications are
/// handled inline, which keeps one bridge's envelopes in order.
async fn handle_connection(
    service: Arc<RelayService>,
    stream: UnixStream,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER);
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let id = service.hub.next_connection_id();
    let (captures, capture_worker) = spawn_capture_worker(Arc::clone(&service.relay), id);
    let session = Session {
        id,
        outbound,
        captures,
    };
    tracing::debug!(connection = session.id, "connection accepted");
    let result = read_loop(&service, &session, reader, &cancel).await;

    if let Some(surfaces) = service.hub.remove(session.id) {
        service.relay.set_surfaces(surfaces);
    }
    drop(session);
    if let Err(e) = capture_worker.await {
        tracing::debug!("capture worker failed: {e}");
    }
    match writer_task.await {
        Ok(Err(e)) => tracing::debug!("writer stopped: {e}"),
        Err(e) => tracing::debug!("writer task failed: {e}"),
        Ok(Ok(())) => {}
    }
    result
}

async fn read_loop(
    service: &Arc<RelayService>,
    session: &Session,
    reader: tokio::net::unix::OwnedReadHalf,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = match reader.read_line(&mut line).or_cancel(cancel).await {
            Ok(read) => read?,
            Err(_) => break,
        };
        if n == 0 {
            break; // EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<RpcMessage>(trimmed) {
            Ok(RpcMessage::Request(request)) if request.method != METHOD_HELLO => {
                let service = Arc::clone(service);
                let session = session.clone();
                tokio::spawn(async move {
                    let response = dispatch_request(&service, &session, request).await;
                    session.send(&response).await;
                });
            }
            Ok(message) => {
                if let Some(response) = dispatch_message(service, session, message).await {
                    session.send(&response).await;
                }
            }
            Err(e) => {
                let response = error_value(
                    RequestId::Integer(0),
                    ERR_INVALID_REQUEST,
                    format!("Invalid JSON-RPC: {e}"),
                );
                session.send(&response).await;
            }
        }
    }

    Ok(())
}

/// Dispatch one parsed message. Returns the reply for requests.
async fn dispatch_message(
    service: &Arc<RelayService>,
    session: &Session,
    message: RpcMessage,
) -> Option<Value> {
    match message {
        RpcMessage::Request(request) => Some(dispatch_request(service, session, request).await),
        RpcMessage::Notification(notification) => {
            handle_notification(service, session, notification).await;
            None
        }
        RpcMessage::Response(_) | RpcMessage::Error(_) => {
            tracing::debug!(connection = session.id, "ignoring unsolicited response");
            None
        }
    }
}

async fn dispatch_request(
    service: &Arc<RelayService>,
    session: &Session,
    request: RpcRequest,
) -> Value {
    let id = request.id.clone();
    match dispatch_method(service, session, &request.method, request.params).await {
        Ok(value) => serde_json::to_value(RpcResponse { id, result: value }).unwrap_or_default(),
        Err((code, message)) => error_value(id, code, message),
    }
}

fn error_value(id: RequestId, code: i64, message: String) -> Value {
    serde_json::to_value(RpcError::new(id, code, message)).unwrap_or_default()
}

/// Dispatch to the appropriate handler based on method name.
async fn dispatch_method(
    service: &Arc<RelayService>,
    session: &Session,
    method: &str,
    params: Option<Value>,
) -> RpcResult {
    match method {
        METHOD_HELLO => handle_hello(service, session, params),
        METHOD_BRIDGE_ENVELOPE => {
            let params: BridgeEnvelopeParams = parse_params(method, params)?;
            accept_envelope(service, session, params.envelope).await
        }
        METHOD_COMMAND_ISSUE => handle_command_issue(service, params).await,
        METHOD_SERVICE_STATUS => handle_service_status(service),
        METHOD_REGISTRY_LIST => to_result(RegistryListResult {
            endpoints: service.relay.registry_list(),
        }),
        METHOD_QUEUE_DRAIN => to_result(service.relay.drain_queue().await),
        _ => Err((ERR_METHOD_NOT_FOUND, format!("Unknown method: {method}"))),
    }
}

async fn handle_notification(
    service: &Arc<RelayService>,
    session: &Session,
    notification: RpcNotification,
) {
    if notification.method != METHOD_BRIDGE_ENVELOPE {
        tracing::debug!(method = %notification.method, "ignoring unknown notification");
        return;
    }
    if let Err((code, message)) = accept_notified(service, session, notification.params).await {
        tracing::debug!(connection = session.id, code, %message, "envelope not accepted");
    }
}

/// Captures go to the connection's worker; everything else is handled now.
async fn accept_notified(
    service: &Arc<RelayService>,
    session: &Session,
    params: Option<Value>,
) -> RpcResult {
    let params: BridgeEnvelopeParams = parse_params(METHOD_BRIDGE_ENVELOPE, params)?;
    match open_envelope(service, params.envelope)? {
        BridgeMessage::Capture(capture) => {
            if session.captures.send(capture).await.is_err() {
                tracing::debug!(connection = session.id, "capture worker gone");
            }
            Ok(Value::Null)
        }
        other => accept_message(service, session, other).await,
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    method: &str,
    params: Option<Value>,
) -> Result<T, (i64, String)> {
    params
        .ok_or_else(|| (ERR_INVALID_PARAMS, "Missing params".to_string()))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| (ERR_INVALID_PARAMS, format!("Invalid {method} params: {e}")))
        })
}

fn to_result<T: serde::Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| (ERR_INFRA, format!("Serialize error: {e}")))
}

/// Handle the `hello` handshake. Bridges are registered for command pushes.
fn handle_hello(service: &RelayService, session: &Session, params: Option<Value>) -> RpcResult {
    let hello: HelloParams = parse_params(METHOD_HELLO, params)?;

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err((
            ERR_INVALID_PARAMS,
            format!(
                "Incompatible protocol version: client={}, service={}",
                hello.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }
    if hello.role == ClientRole::Bridge {
        service.hub.register(session.id, session.outbound.clone());
    }
    tracing::debug!(
        connection = session.id,
        client_version = %hello.client_version,
        role = ?hello.role,
        "hello"
    );

    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: service.relay.instance_id().to_string(),
        capabilities: [
            METHOD_BRIDGE_ENVELOPE,
            METHOD_COMMAND_ISSUE,
            METHOD_SERVICE_STATUS,
            METHOD_REGISTRY_LIST,
            METHOD_QUEUE_DRAIN,
        ]
        .iter()
        .map(ToString::to_string)
        .collect(),
    })
}

fn open_envelope(service: &RelayService, envelope: Envelope) -> Result<BridgeMessage, (i64, String)> {
    service
        .relay
        .open_envelope(envelope)
        .map_err(|e| pipeline_error_to_rpc(&e))
}

/// Validate and route one envelope sent as a request.
async fn accept_envelope(
    service: &Arc<RelayService>,
    session: &Session,
    envelope: Envelope,
) -> RpcResult {
    let message = open_envelope(service, envelope)?;
    accept_message(service, session, message).await
}

/// Route one validated message. Surface reports are merged across every
/// connected bridge before they reach the relay.
async fn accept_message(
    service: &Arc<RelayService>,
    session: &Session,
    message: BridgeMessage,
) -> RpcResult {
    match message {
        BridgeMessage::Capture(capture) => {
            let receipt = service
                .relay
                .record_capture(capture)
                .await
                .map_err(|e| pipeline_error_to_rpc(&e))?;
            to_result(receipt)
        }
        BridgeMessage::Surfaces(surfaces) => {
            let merged = service
                .hub
                .set_surfaces(session.id, surfaces)
                .ok_or_else(|| {
                    (
                        ERR_INVALID_PARAMS,
                        "surfaces may only be reported by a bridge".to_string(),
                    )
                })?;
            let count = merged.len();
            service.relay.set_surfaces(merged);
            Ok(serde_json::json!({ "surfaces": count }))
        }
        other => {
            service
                .relay
                .handle_message(other)
                .await
                .map_err(|e| pipeline_error_to_rpc(&e))?;
            Ok(serde_json::json!({ "accepted": true }))
        }
    }
}

async fn handle_command_issue(service: &RelayService, params: Option<Value>) -> RpcResult {
    let params: CommandIssueParams = parse_params(METHOD_COMMAND_ISSUE, params)?;
    let result = service
        .relay
        .issue_command(params.surface, params.action)
        .await
        .map_err(|e| pipeline_error_to_rpc(&e))?;
    to_result(result)
}

fn handle_service_status(service: &RelayService) -> RpcResult {
    to_result(ServiceStatusResult {
        snapshot: service.relay.status(),
        bridges: service.hub.bridge_count(),
        surfaces: service.relay.surfaces(),
    })
}

/// Map PipelineError to JSON-RPC error (code, message).
fn pipeline_error_to_rpc(err: &PipelineError) -> (i64, String) {
    let code = match err {
        PipelineError::Command(
            CommandError::NoEligibleSurface | CommandError::SurfaceNotEligible(_),
        ) => ERR_NO_SURFACE,
        PipelineError::Command(CommandError::Timeout { .. }) => ERR_COMMAND_TIMEOUT,
        PipelineError::Command(CommandError::Transport { .. } | CommandError::Cancelled(_)) => {
            ERR_TRANSPORT
        }
        PipelineError::Envelope(_) | PipelineError::MalformedCapture(_) => ERR_MALFORMED_ENVELOPE,
        PipelineError::UnexpectedMessage(_) => ERR_INVALID_PARAMS,
        _ => ERR_INFRA,
    };
    (code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetap_core::backend::{BackendClient, BackendError};
    use pagetap_core::delegator::{RuleClassifier, TaskDelegator};
    use pagetap_core::{EndpointRegistry, RelayDeps, RelaySettings};
    use pagetap_protocol::ingest::IngestRecord;
    use pagetap_protocol::{CommandAction, CommandId, CommandResult};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct OfflineBackend;

    #[async_trait]
    impl BackendClient for OfflineBackend {
        async fn ingest(&self, _record: &IngestRecord) -> Result<(), BackendError> {
            Err(BackendError::Unreachable("offline".to_string()))
        }

        async fn health(&self) -> Result<(), BackendError> {
            Err(BackendError::Unreachable("offline".to_string()))
        }
    }

    /// Healthy, but each ingest takes `delay`.
    struct SlowBackend {
        delay: Duration,
    }

    #[async_trait]
    impl BackendClient for SlowBackend {
        async fn ingest(&self, _record: &IngestRecord) -> Result<(), BackendError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn health(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn service(command_timeout: Duration) -> Arc<RelayService> {
        service_with(command_timeout, Arc::new(OfflineBackend))
    }

    fn service_with(
        command_timeout: Duration,
        backend: Arc<dyn BackendClient>,
    ) -> Arc<RelayService> {
        let hub = Arc::new(BridgeHub::new());
        let relay = RelayProcess::new(
            RelaySettings {
                command_timeout,
                ..RelaySettings::default()
            },
            RelayDeps {
                backend,
                transport: Arc::clone(&hub) as Arc<dyn CommandTransport>,
                delegator: Arc::new(TaskDelegator::rules_only(RuleClassifier::default())),
                registry: EndpointRegistry::in_memory(),
            },
        );
        Arc::new(RelayService::new(Arc::new(relay), hub))
    }

    fn session(service: &RelayService) -> (Session, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(16);
        let id = service.hub.next_connection_id();
        let (captures, _worker) = spawn_capture_worker(Arc::clone(&service.relay), id);
        (
            Session {
                id,
                outbound,
                captures,
            },
            rx,
        )
    }

    async fn call(service: &Arc<RelayService>, session: &Session, msg: Value) -> Value {
        let request: RpcRequest = serde_json::from_value(msg).unwrap();
        dispatch_request(service, session, request).await
    }

    fn hello(role: &str) -> Value {
        json!({
            "id": 0,
            "method": "hello",
            "params": {
                "protocol_version": PROTOCOL_VERSION,
                "client_version": "0.1.0",
                "role": role
            }
        })
    }

    #[tokio::test]
    async fn dispatch_hello() {
        let service = service(Duration::from_secs(1));
        let (session, _rx) = session(&service);
        let result = call(&service, &session, hello("client")).await;
        let result_obj = result
            .as_object()
            .unwrap_or_else(|| panic!("Expected object"));
        assert!(
            result_obj.contains_key("result"),
            "Expected result field, got: {result}"
        );
        assert_eq!(result["result"]["instance_id"], service.relay.instance_id());
        assert_eq!(service.hub.bridge_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_hello_rejects_other_versions() {
        let service = service(Duration::from_secs(1));
        let (session, _rx) = session(&service);
        let result = call(
            &service,
            &session,
            json!({
                "id": 0,
                "method": "hello",
                "params": {"protocol_version": "9.9", "client_version": "x"}
            }),
        )
        .await;
        assert_eq!(result["error"]["code"], ERR_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn dispatch_unknown_method() {
        let service = service(Duration::from_secs(1));
        let (session, _rx) = session(&service);
        let result = call(&service, &session, json!({"id": 1, "method": "unknown.method"})).await;
        assert_eq!(result["error"]["code"], ERR_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_capture_envelope_is_rejected_and_counted() {
        let service = service(Duration::from_secs(1));
        let (session, _rx) = session(&service);
        let result = call(
            &service,
            &session,
            json!({
                "id": 2,
                "method": "bridge.envelope",
                "params": {"envelope": {"kind": "capture", "version": 1, "payload": {"url": 3}}}
            }),
        )
        .await;
        assert_eq!(result["error"]["code"], ERR_MALFORMED_ENVELOPE);
        assert_eq!(service.relay.status().counters.captures_malformed, 1);
    }

    #[tokio::test]
    async fn surfaces_from_non_bridge_are_refused() {
        let service = service(Duration::from_secs(1));
        let (session, _rx) = session(&service);
        let envelope = BridgeMessage::Surfaces(vec![SurfaceId::new("tab")]).seal();
        let result = call(
            &service,
            &session,
            json!({"id": 3, "method": "bridge.envelope", "params": {"envelope": envelope}}),
        )
        .await;
        assert_eq!(result["error"]["code"], ERR_INVALID_PARAMS);
        assert!(service.relay.surfaces().is_empty());
    }

    #[tokio::test]
    async fn command_without_surface_is_rejected() {
        let service = service(Duration::from_secs(1));
        let (session, _rx) = session(&service);
        let result = call(
            &service,
            &session,
            json!({"id": 4, "method": "command.issue", "params": {"action": "ping"}}),
        )
        .await;
        assert_eq!(result["error"]["code"], ERR_NO_SURFACE);
        assert!(service.relay.pending_commands().is_empty());
    }

    #[tokio::test]
    async fn command_round_trips_through_bridge() {
        let service = service(Duration::from_secs(5));
        let (bridge, mut pushes) = session(&service);
        call(&service, &bridge, hello("bridge")).await;
        assert_eq!(service.hub.bridge_count(), 1);

        let surfaces = BridgeMessage::Surfaces(vec![SurfaceId::new("tab-1")]).seal();
        handle_notification(
            &service,
            &bridge,
            RpcNotification {
                method: METHOD_BRIDGE_ENVELOPE.to_string(),
                params: Some(json!({ "envelope": surfaces })),
            },
        )
        .await;
        assert_eq!(service.relay.surfaces(), vec![SurfaceId::new("tab-1")]);

        let issuer = {
            let service = Arc::clone(&service);
            let (client, _rx) = session(&service);
            tokio::spawn(async move {
                call(
                    &service,
                    &client,
                    json!({
                        "id": 5,
                        "method": "command.issue",
                        "params": {"action": "fetch_json", "url": "/api/chart/1/labs"}
                    }),
                )
                .await
            })
        };

        let line = pushes.recv().await.unwrap();
        let push: RpcNotification = serde_json::from_slice(&line).unwrap();
        assert_eq!(push.method, NOTIFY_BRIDGE_COMMAND);
        let params: BridgeEnvelopeParams = serde_json::from_value(push.params.unwrap()).unwrap();
        let BridgeMessage::Command(request) = params.envelope.open().unwrap() else {
            panic!("expected a command envelope");
        };
        assert_eq!(request.surface, SurfaceId::new("tab-1"));
        assert_eq!(request.action, CommandAction::fetch("/api/chart/1/labs"));

        let reply = BridgeMessage::CommandResult(CommandResult::ok(
            request.command_id.clone(),
            json!({"labs": []}),
        ))
        .seal();
        handle_notification(
            &service,
            &bridge,
            RpcNotification {
                method: METHOD_BRIDGE_ENVELOPE.to_string(),
                params: Some(json!({ "envelope": reply })),
            },
        )
        .await;

        let response = issuer.await.unwrap();
        assert_eq!(response["result"]["success"], true);
        assert_eq!(response["result"]["data"], json!({"labs": []}));
        assert_eq!(
            response["result"]["command_id"],
            json!(request.command_id.as_str())
        );
    }

    fn notification(envelope: Envelope) -> RpcNotification {
        RpcNotification {
            method: METHOD_BRIDGE_ENVELOPE.to_string(),
            params: Some(json!({ "envelope": envelope })),
        }
    }

    #[tokio::test]
    async fn slow_capture_does_not_delay_command_result() {
        let service = service_with(
            Duration::from_secs(1),
            Arc::new(SlowBackend {
                delay: Duration::from_secs(3),
            }),
        );
        service.relay.health_tick().await;
        let (bridge, mut pushes) = session(&service);
        call(&service, &bridge, hello("bridge")).await;
        handle_notification(
            &service,
            &bridge,
            notification(BridgeMessage::Surfaces(vec![SurfaceId::new("tab-1")]).seal()),
        )
        .await;

        let issuer = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .relay
                    .issue_command(None, CommandAction::fetch("/api/chart/1/labs"))
                    .await
            })
        };
        let line = pushes.recv().await.unwrap();
        let push: RpcNotification = serde_json::from_slice(&line).unwrap();
        let params: BridgeEnvelopeParams = serde_json::from_value(push.params.unwrap()).unwrap();
        let BridgeMessage::Command(request) = params.envelope.open().unwrap() else {
            panic!("expected a command envelope");
        };

        // Same connection, same order as on the wire: capture first.
        let capture = Capture::new(
            pagetap_protocol::SourceChannel::PrimaryHook,
            "GET",
            "https://h.example/chart/1/medications",
            200,
            json!({"medications": []}),
        );
        tokio::time::timeout(
            Duration::from_millis(200),
            handle_notification(
                &service,
                &bridge,
                notification(BridgeMessage::Capture(capture).seal()),
            ),
        )
        .await
        .expect("capture notification must not wait for ingest");
        handle_notification(
            &service,
            &bridge,
            notification(
                BridgeMessage::CommandResult(CommandResult::ok(
                    request.command_id.clone(),
                    json!({"labs": []}),
                ))
                .seal(),
            ),
        )
        .await;

        let result = issuer.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.command_id, request.command_id);
    }

    #[tokio::test]
    async fn disconnect_withdraws_bridge_surfaces() {
        let service = service(Duration::from_secs(1));
        let (first, _rx1) = session(&service);
        let (second, _rx2) = session(&service);
        service.hub.register(first.id, first.outbound.clone());
        service.hub.register(second.id, second.outbound.clone());
        service
            .hub
            .set_surfaces(first.id, vec![SurfaceId::new("a"), SurfaceId::new("b")]);
        let merged = service
            .hub
            .set_surfaces(second.id, vec![SurfaceId::new("b"), SurfaceId::new("c")])
            .unwrap();
        assert_eq!(
            merged,
            vec![SurfaceId::new("a"), SurfaceId::new("b"), SurfaceId::new("c")]
        );

        let remaining = service.hub.remove(first.id).unwrap();
        assert_eq!(remaining, vec![SurfaceId::new("b"), SurfaceId::new("c")]);
        assert!(service.hub.remove(first.id).is_none());
    }

    #[tokio::test]
    async fn transport_fails_without_owning_bridge() {
        let hub = BridgeHub::new();
        let err = hub
            .dispatch(CommandRequest {
                command_id: CommandId::from("c"),
                surface: SurfaceId::new("nowhere"),
                action: CommandAction::Ping,
            })
            .await
            .unwrap_err();
        assert!(err.contains("nowhere"));
    }
}
