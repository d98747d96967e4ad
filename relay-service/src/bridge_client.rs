//! The bridge side of the relay socket.
//!
//! A bridge connects once, says `hello` with the bridge role, then forwards
//! every envelope its pages emit as a `bridge.envelope` notification and
//! hands `bridge.command` pushes to the page that owns the target surface.
//! When the relay goes away the port turns invalid for good; the bridge
//! does not reconnect to a new relay instance.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use pagetap_async_utils::sleep_or_cancel;
use pagetap_core::config::MatcherConfig;
use pagetap_core::{
    ConfigError, ContextBridge, HostPort, PagetapConfig, PatternMatcher, PortError, RelayPort,
};
use pagetap_protocol::jsonrpc::{RequestId, RpcMessage, RpcNotification, RpcRequest, encode_line};
use pagetap_protocol::{BridgeMessage, Envelope, SurfaceId};
use pagetap_recorder::cdp::{CdpBrowser, CdpTarget};
use pagetap_recorder::page_hook::{self, CdpHostPort};
use pagetap_recorder::{RecorderError, RecorderState, TrafficRecorder};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::PROTOCOL_VERSION;
use crate::protocol::{
    BridgeEnvelopeParams, ClientRole, HelloParams, HelloResult, METHOD_BRIDGE_ENVELOPE,
    METHOD_HELLO, NOTIFY_BRIDGE_COMMAND,
};

/// How often pages are re-enumerated.
const SURFACE_REFRESH: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot connect to relay at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("relay handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("relay {instance_id} went away")]
    RelayGone { instance_id: String },

    #[error("browser connection closed")]
    BrowserGone,
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay connection
// ─────────────────────────────────────────────────────────────────────────────

/// [`RelayPort`] over the relay socket.
pub struct SocketRelayPort {
    outbound: mpsc::Sender<Vec<u8>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl RelayPort for SocketRelayPort {
    fn is_valid(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    async fn send(&self, envelope: Envelope) -> Result<(), PortError> {
        if !self.is_valid() {
            return Err(PortError::Invalidated);
        }
        let params = serde_json::to_value(BridgeEnvelopeParams { envelope })
            .map_err(|e| PortError::Send(e.to_string()))?;
        let line = encode_line(&RpcNotification {
            method: METHOD_BRIDGE_ENVELOPE.to_string(),
            params: Some(params),
        });
        self.outbound
            .send(line)
            .await
            .map_err(|_| PortError::Invalidated)
    }
}

pub struct RelayConnection {
    /// The relay instance this connection belongs to.
    pub instance_id: String,
    pub port: Arc<SocketRelayPort>,
    /// Command envelopes pushed by the relay. Closes with the connection.
    pub commands: mpsc::Receiver<Envelope>,
}

pub async fn connect(path: &Path, capacity: usize) -> Result<RelayConnection, BridgeError> {
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| BridgeError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
    handshake(stream, capacity).await
}

/// Say `hello` as a bridge on an already-open stream.
pub async fn handshake(stream: UnixStream, capacity: usize) -> Result<RelayConnection, BridgeError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let params = serde_json::to_value(HelloParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
        role: ClientRole::Bridge,
    })
    .map_err(|e| BridgeError::Handshake(e.to_string()))?;
    let hello = RpcRequest {
        id: RequestId::Integer(0),
        method: METHOD_HELLO.to_string(),
        params: Some(params),
    };
    write_line(&mut writer, &encode_line(&hello)).await?;

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(BridgeError::Handshake(
            "relay closed the connection".to_string(),
        ));
    }
    let instance_id = match serde_json::from_str::<RpcMessage>(line.trim()) {
        Ok(RpcMessage::Response(response)) => {
            serde_json::from_value::<HelloResult>(response.result)
                .map_err(|e| BridgeError::Handshake(format!("invalid hello result: {e}")))?
                .instance_id
        }
        Ok(RpcMessage::Error(error)) => return Err(BridgeError::Handshake(error.error.message)),
        Ok(_) => {
            return Err(BridgeError::Handshake(
                "unexpected reply to hello".to_string(),
            ));
        }
        Err(e) => return Err(BridgeError::Handshake(format!("invalid reply: {e}"))),
    };

    let capacity = capacity.max(1);
    let alive = Arc::new(AtomicBool::new(true));
    let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(capacity);
    let writer_alive = Arc::clone(&alive);
    tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if let Err(e) = write_line(&mut writer, &bytes).await {
                tracing::debug!(error = %e, "relay socket write failed");
                break;
            }
        }
        writer_alive.store(false, Ordering::Release);
    });

    let (commands_tx, commands) = mpsc::channel(capacity);
    tokio::spawn(read_pushes(reader, commands_tx, Arc::clone(&alive)));

    Ok(RelayConnection {
        instance_id,
        port: Arc::new(SocketRelayPort { outbound, alive }),
        commands,
    })
}

async fn write_line(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_pushes(
    mut reader: BufReader<OwnedReadHalf>,
    commands: mpsc::Sender<Envelope>,
    alive: Arc<AtomicBool>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "relay socket read failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<RpcMessage>(trimmed) {
            Ok(RpcMessage::Notification(push)) if push.method == NOTIFY_BRIDGE_COMMAND => {
                match push.params.map(serde_json::from_value::<BridgeEnvelopeParams>) {
                    Some(Ok(params)) => {
                        if commands.send(params.envelope).await.is_err() {
                            break;
                        }
                    }
                    _ => tracing::debug!("malformed bridge.command push"),
                }
            }
            Ok(RpcMessage::Error(rejected)) => tracing::debug!(
                code = rejected.error.code,
                message = %rejected.error.message,
                "relay rejected a message"
            ),
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "unparseable line from relay"),
        }
    }
    alive.store(false, Ordering::Release);
    tracing::info!("relay connection closed");
}

// ─────────────────────────────────────────────────────────────────────────────
// Pages
// ─────────────────────────────────────────────────────────────────────────────

/// [`HostPort`] that hands each command to the page named by its `surface`.
#[derive(Default)]
pub struct PageRouter {
    pages: RwLock<BTreeMap<SurfaceId, Arc<dyn HostPort>>>,
}

impl PageRouter {
    pub fn contains(&self, surface: &SurfaceId) -> bool {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(surface)
    }

    pub fn insert(&self, surface: SurfaceId, port: Arc<dyn HostPort>) {
        self.pages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(surface, port);
    }

    /// Drop pages not in `live`. Returns how many went away.
    pub fn retain(&self, live: &[SurfaceId]) -> usize {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let before = pages.len();
        pages.retain(|surface, _| live.contains(surface));
        before - pages.len()
    }

    pub fn surfaces(&self) -> Vec<SurfaceId> {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn port(&self, surface: &SurfaceId) -> Option<Arc<dyn HostPort>> {
        self.pages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(surface)
            .cloned()
    }
}

#[async_trait]
impl HostPort for PageRouter {
    async fn deliver(&self, envelope: Envelope) -> Result<(), PortError> {
        let surface = envelope
            .payload
            .get("surface")
            .and_then(serde_json::Value::as_str)
            .map(SurfaceId::new)
            .ok_or_else(|| PortError::Send("command names no surface".to_string()))?;
        let port = self
            .port(&surface)
            .ok_or_else(|| PortError::Send(format!("surface {surface} is gone")))?;
        port.deliver(envelope).await
    }
}

/// Install the hook on new eligible pages and forget closed ones. Returns
/// the surfaces that can run commands now.
async fn sync_pages(
    browser: &CdpBrowser,
    router: &PageRouter,
    matcher: &MatcherConfig,
    host_tx: &mpsc::Sender<Envelope>,
) -> Result<Vec<SurfaceId>, RecorderError> {
    let pages = browser.pages().await?;
    let live: Vec<SurfaceId> = pages.iter().map(|(id, _)| id.clone()).collect();
    let closed = router.retain(&live);
    if closed > 0 {
        tracing::debug!(closed, "pages closed");
    }
    for (surface, page) in pages {
        if router.contains(&surface) {
            continue;
        }
        if let Err(e) = page_hook::install(&page, matcher).await {
            tracing::warn!(%surface, error = %e, "hook install failed");
            continue;
        }
        if let Err(e) = page_hook::forward_page_envelopes(&page, host_tx.clone()).await {
            tracing::warn!(%surface, error = %e, "page binding unavailable");
            continue;
        }
        tracing::info!(%surface, "page hooked");
        router.insert(surface, Arc::new(CdpHostPort::new(page)));
    }
    Ok(router.surfaces())
}

/// Re-attach the recorder to the first surface whenever it is detached.
async fn keep_recording(recorder: &TrafficRecorder, surfaces: &[SurfaceId]) {
    if recorder.state() != RecorderState::Detached {
        return;
    }
    let Some(surface) = surfaces.first() else {
        return;
    };
    if let Err(e) = recorder.attach(surface.clone()).await {
        tracing::warn!(%surface, error = %e, "recorder attach failed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge process
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub socket_path: PathBuf,
    pub debug_port: u16,
    /// Also run the traffic recorder against the first surface.
    pub record_traffic: bool,
}

/// Run a bridge until `cancel` fires, the relay goes away, or the browser
/// connection closes.
pub async fn run_bridge(
    config: &PagetapConfig,
    options: BridgeOptions,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    let capacity = config.relay.channel_capacity;
    let RelayConnection {
        instance_id,
        port,
        commands,
    } = connect(&options.socket_path, capacity).await?;
    tracing::info!(
        %instance_id,
        socket = %options.socket_path.display(),
        "bridge connected to relay"
    );

    let browser = Arc::new(
        CdpBrowser::connect(options.debug_port, config.recorder.surface_filter.clone()).await?,
    );
    let router = Arc::new(PageRouter::default());
    let (host_tx, host_rx) = mpsc::channel(capacity.max(1));

    let recorder = if options.record_traffic {
        let matcher = PatternMatcher::from_config(&config.matcher)?;
        Some(TrafficRecorder::new(
            Arc::new(CdpTarget::new(Arc::clone(&browser))),
            Arc::new(matcher),
            host_tx.clone(),
            Duration::from_millis(config.recorder.body_timeout_ms),
        ))
    } else {
        None
    };

    let bridge = Arc::new(ContextBridge::new(
        Arc::clone(&port) as Arc<dyn RelayPort>,
        Arc::clone(&router) as Arc<dyn HostPort>,
    ));
    let session = cancel.child_token();
    let pump = {
        let bridge = Arc::clone(&bridge);
        let session = session.clone();
        tokio::spawn(async move { bridge.run(host_rx, commands, session).await })
    };

    let mut reported: Option<Vec<SurfaceId>> = None;
    let outcome = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        if !port.is_valid() || bridge.is_invalidated() {
            break Err(BridgeError::RelayGone {
                instance_id: instance_id.clone(),
            });
        }
        if !browser.is_alive() {
            break Err(BridgeError::BrowserGone);
        }

        match sync_pages(&browser, &router, &config.matcher, &host_tx).await {
            Ok(surfaces) => {
                if let Some(recorder) = &recorder {
                    keep_recording(recorder, &surfaces).await;
                }
                if reported.as_ref() != Some(&surfaces) {
                    tracing::info!(count = surfaces.len(), "reporting surfaces");
                    let envelope = BridgeMessage::Surfaces(surfaces.clone()).seal();
                    if host_tx.send(envelope).await.is_err() {
                        break Ok(());
                    }
                    reported = Some(surfaces);
                }
            }
            Err(e) => tracing::warn!(error = %e, "page refresh failed"),
        }

        if !sleep_or_cancel(SURFACE_REFRESH, &cancel).await {
            break Ok(());
        }
    };

    session.cancel();
    if let Err(e) = pump.await {
        tracing::debug!(error = %e, "bridge pump task failed");
    }
    if let Some(recorder) = &recorder {
        recorder.detach();
    }
    tracing::info!(stats = ?bridge.stats(), "bridge stopped");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagetap_core::bridge::ChannelHostPort;
    use pagetap_protocol::jsonrpc::RpcResponse;
    use pagetap_protocol::{Capture, CommandAction, CommandId, CommandRequest, SourceChannel};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Plays the relay side of a socket pair.
    struct FakeRelay {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl FakeRelay {
        async fn read(&mut self) -> serde_json::Value {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn write(&mut self, value: &impl serde::Serialize) {
            self.writer.write_all(&encode_line(value)).await.unwrap();
        }
    }

    async fn connected() -> (RelayConnection, FakeRelay) {
        let (bridge_side, relay_side) = UnixStream::pair().unwrap();
        let (reader, writer) = relay_side.into_split();
        let mut relay = FakeRelay {
            reader: BufReader::new(reader),
            writer,
        };
        let relay_task = tokio::spawn(async move {
            let hello = relay.read().await;
            assert_eq!(hello["method"], "hello");
            assert_eq!(hello["params"]["role"], "bridge");
            relay
                .write(&RpcResponse {
                    id: RequestId::Integer(0),
                    result: json!({
                        "protocol_version": PROTOCOL_VERSION,
                        "service_version": "test",
                        "instance_id": "relay-1",
                        "capabilities": []
                    }),
                })
                .await;
            relay
        });
        let connection = handshake(bridge_side, 8).await.unwrap();
        (connection, relay_task.await.unwrap())
    }

    #[tokio::test]
    async fn handshake_reports_instance_and_carries_envelopes() {
        let (mut connection, mut relay) = connected().await;
        assert_eq!(connection.instance_id, "relay-1");
        assert!(connection.port.is_valid());

        let capture = Capture::new(
            SourceChannel::PrimaryHook,
            "GET",
            "https://h/api/labs",
            200,
            json!({"labs": []}),
        );
        connection
            .port
            .send(BridgeMessage::Capture(capture).seal())
            .await
            .unwrap();
        let sent = relay.read().await;
        assert_eq!(sent["method"], "bridge.envelope");
        assert_eq!(sent["params"]["envelope"]["kind"], "capture");
        assert!(sent.get("id").is_none());

        let command = BridgeMessage::Command(CommandRequest {
            command_id: CommandId::from("c-1"),
            surface: SurfaceId::new("tab-1"),
            action: CommandAction::Ping,
        })
        .seal();
        relay
            .write(&RpcNotification {
                method: NOTIFY_BRIDGE_COMMAND.to_string(),
                params: Some(json!({ "envelope": command })),
            })
            .await;
        let pushed = connection.commands.recv().await.unwrap();
        assert_eq!(pushed, command);
    }

    #[tokio::test]
    async fn relay_closing_invalidates_port() {
        let (mut connection, relay) = connected().await;
        drop(relay);

        assert_eq!(connection.commands.recv().await, None);
        assert!(!connection.port.is_valid());
        assert_eq!(
            connection
                .port
                .send(BridgeMessage::Surfaces(Vec::new()).seal())
                .await,
            Err(PortError::Invalidated)
        );
    }

    #[tokio::test]
    async fn hello_rejection_fails_handshake() {
        let (bridge_side, relay_side) = UnixStream::pair().unwrap();
        let (reader, writer) = relay_side.into_split();
        let mut relay = FakeRelay {
            reader: BufReader::new(reader),
            writer,
        };
        let relay_task = tokio::spawn(async move {
            relay.read().await;
            relay
                .write(&json!({"id": 0, "error": {"code": -32602, "message": "Incompatible protocol version"}}))
                .await;
            relay
        });
        let err = match handshake(bridge_side, 8).await {
            Ok(_) => panic!("handshake should fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("Incompatible protocol version"));
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn router_delivers_to_owning_page() {
        let router = PageRouter::default();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        router.insert(SurfaceId::new("a"), Arc::new(ChannelHostPort(tx_a)));
        router.insert(SurfaceId::new("b"), Arc::new(ChannelHostPort(tx_b)));

        let command = BridgeMessage::Command(CommandRequest {
            command_id: CommandId::from("c-2"),
            surface: SurfaceId::new("b"),
            action: CommandAction::fetch("/api/x"),
        })
        .seal();
        router.deliver(command.clone()).await.unwrap();
        assert_eq!(rx_b.recv().await, Some(command));
        assert!(rx_a.try_recv().is_err());

        assert_eq!(router.retain(&[SurfaceId::new("a")]), 1);
        assert_eq!(router.surfaces(), vec![SurfaceId::new("a")]);
        let orphan = BridgeMessage::Command(CommandRequest {
            command_id: CommandId::from("c-3"),
            surface: SurfaceId::new("b"),
            action: CommandAction::Ping,
        })
        .seal();
        assert!(matches!(
            router.deliver(orphan).await,
            Err(PortError::Send(_))
        ));
    }
}
