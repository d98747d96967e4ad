//! Persistent command link to the backend.
//!
//! One TCP connection carrying newline-delimited JSON. The backend may send
//! `command` and `ping` lines; each command is issued through the relay and
//! answered with a `command_result` line. On disconnect the link reconnects
//! with jittered exponential backoff. The backoff keeps growing across
//! sessions that close quickly and starts over only after a session stayed
//! up for at least the maximum delay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder, Retryable};
use pagetap_async_utils::{OrCancelExt, sleep_or_cancel};
use pagetap_core::RelayProcess;
use pagetap_core::config::BackendConfig;
use pagetap_protocol::ingest::{BackendInbound, BackendOutbound};
use pagetap_protocol::jsonrpc::encode_line;
use pagetap_protocol::{CommandAction, CommandId, CommandResult, SurfaceId};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub addr: String,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl LinkSettings {
    /// `None` when no link address is configured.
    pub fn from_config(config: &BackendConfig) -> Option<Self> {
        Some(Self {
            addr: config.link_addr.clone()?,
            min_delay: Duration::from_millis(config.reconnect_min_ms),
            max_delay: Duration::from_millis(config.reconnect_max_ms),
        })
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_jitter()
            .without_max_times()
    }
}

/// Delay before reconnecting after a session ends.
struct SessionBackoff {
    settings: LinkSettings,
    delays: ExponentialBackoff,
}

impl SessionBackoff {
    fn new(settings: &LinkSettings) -> Self {
        Self {
            settings: settings.clone(),
            delays: settings.backoff().build(),
        }
    }

    fn after_session(&mut self, lasted: Duration) -> Duration {
        if lasted >= self.settings.max_delay {
            self.delays = self.settings.backoff().build();
            return self.settings.min_delay;
        }
        self.delays.next().unwrap_or(self.settings.max_delay)
    }
}

/// Keep the link up until `cancel` fires.
pub async fn run_link(relay: Arc<RelayProcess>, settings: LinkSettings, cancel: CancellationToken) {
    tracing::info!(addr = %settings.addr, "backend link starting");
    let mut closed = SessionBackoff::new(&settings);
    loop {
        let addr = settings.addr.as_str();
        let connected = (|| TcpStream::connect(addr))
            .retry(settings.backoff())
            .notify(|e: &std::io::Error, delay: Duration| {
                tracing::debug!(error = %e, ?delay, "backend link connect failed, retrying");
            })
            .or_cancel(&cancel)
            .await;
        let stream = match connected {
            Err(_) => break,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "backend link gave up connecting");
                if !sleep_or_cancel(settings.max_delay, &cancel).await {
                    break;
                }
                continue;
            }
            Ok(Ok(stream)) => stream,
        };

        tracing::info!(addr = %settings.addr, "backend link connected");
        let started = Instant::now();
        match run_session(Arc::clone(&relay), stream, &cancel).await {
            Ok(()) => tracing::info!("backend link closed"),
            Err(e) => tracing::warn!(error = %e, "backend link failed"),
        }
        let delay = closed.after_session(started.elapsed());
        tracing::debug!(?delay, "backend link reconnecting");
        if !sleep_or_cancel(delay, &cancel).await {
            break;
        }
    }
    tracing::info!("backend link stopped");
}

/// Serve one connection: say hello, then answer inbound lines until EOF.
pub async fn run_session<S>(
    relay: Arc<RelayProcess>,
    stream: S,
    cancel: &CancellationToken,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_BUFFER);
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let hello = BackendOutbound::Hello {
        instance_id: relay.instance_id().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    // The writer only stops early on an I/O error, which its join reports.
    let _ = outbound.send(encode_line(&hello)).await;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let read_result = loop {
        line.clear();
        let n = match reader.read_line(&mut line).or_cancel(cancel).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break Err(e),
            Err(_) => break Ok(()),
        };
        if n == 0 {
            break Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<BackendInbound>(trimmed) {
            Ok(BackendInbound::Ping) => {
                let _ = outbound.send(encode_line(&BackendOutbound::Pong)).await;
            }
            Ok(BackendInbound::Command {
                command_id,
                surface,
                action,
            }) => {
                let relay = Arc::clone(&relay);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let reply = answer_command(&relay, command_id, surface, action).await;
                    let _ = outbound.send(encode_line(&reply)).await;
                });
            }
            Err(e) => tracing::debug!(error = %e, "unparseable backend line"),
        }
    };

    drop(outbound);
    match writer_task.await {
        Ok(Ok(())) => read_result,
        Ok(Err(e)) => read_result.and(Err(e)),
        Err(e) => read_result.and(Err(std::io::Error::other(e))),
    }
}

async fn answer_command(
    relay: &RelayProcess,
    request_id: Option<CommandId>,
    surface: Option<SurfaceId>,
    action: CommandAction,
) -> BackendOutbound {
    let name = action.name();
    let result = match relay.issue_command(surface, action).await {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!(action = name, error = %e, "backend command failed");
            let id = request_id.clone().unwrap_or_else(CommandId::generate);
            CommandResult::failed(id, e.to_string())
        }
    };
    BackendOutbound::CommandResult { request_id, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pagetap_core::backend::{BackendClient, BackendError};
    use pagetap_core::delegator::{RuleClassifier, TaskDelegator};
    use pagetap_core::{CommandTransport, EndpointRegistry, RelayDeps, RelaySettings};
    use pagetap_protocol::CommandRequest;
    use pagetap_protocol::ingest::IngestRecord;
    use pretty_assertions::assert_eq;

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

    struct NoBridge;

    #[async_trait]
    impl CommandTransport for NoBridge {
        async fn dispatch(&self, _request: CommandRequest) -> Result<(), String> {
            Err("no bridge".to_string())
        }
    }

    fn relay() -> Arc<RelayProcess> {
        Arc::new(RelayProcess::new(
            RelaySettings::default(),
            RelayDeps {
                backend: Arc::new(OfflineBackend),
                transport: Arc::new(NoBridge),
                delegator: Arc::new(TaskDelegator::rules_only(RuleClassifier::default())),
                registry: EndpointRegistry::in_memory(),
            },
        ))
    }

    #[test]
    fn link_is_disabled_without_address() {
        let mut config = BackendConfig::default();
        assert_eq!(LinkSettings::from_config(&config), None);

        config.link_addr = Some("127.0.0.1:7000".to_string());
        let settings = LinkSettings::from_config(&config).unwrap();
        assert_eq!(settings.addr, "127.0.0.1:7000");
        assert_eq!(settings.min_delay, Duration::from_millis(500));
        assert_eq!(settings.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn quick_closes_back_off_and_stable_sessions_reset() {
        let settings = LinkSettings {
            addr: "127.0.0.1:7000".to_string(),
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(10),
        };
        let mut backoff = SessionBackoff::new(&settings);
        let quick = Duration::from_millis(1);
        let delays: Vec<Duration> = (0..5).map(|_| backoff.after_session(quick)).collect();
        assert!(delays[0] >= settings.min_delay, "{delays:?}");
        assert!(delays[4] >= Duration::from_millis(160), "{delays:?}");

        assert_eq!(backoff.after_session(settings.max_delay), settings.min_delay);
        let next = backoff.after_session(quick);
        assert!(next < Duration::from_millis(40), "{next:?}");
    }

    #[tokio::test]
    async fn says_hello_and_answers_ping() {
        let relay = relay();
        let hello = encode_line(&BackendOutbound::Hello {
            instance_id: relay.instance_id().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        let stream = tokio_test::io::Builder::new()
            .write(&hello)
            .read(b"{\"type\":\"ping\"}\n")
            .write(&encode_line(&BackendOutbound::Pong))
            .build();

        run_session(relay, stream, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commands_without_surfaces_are_answered_with_failure() {
        let (backend_side, relay_side) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move {
            run_session(relay(), relay_side, &CancellationToken::new()).await
        });

        let (reader, mut writer) = tokio::io::split(backend_side);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let hello: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(hello["type"], "hello");

        writer
            .write_all(b"{\"type\":\"command\",\"command_id\":\"b-7\",\"action\":\"fetch_json\",\"url\":\"/api/labs\"}\n")
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let reply: BackendOutbound = serde_json::from_str(&line).unwrap();
        let BackendOutbound::CommandResult { request_id, result } = reply else {
            panic!("expected a command result, got {line}");
        };
        assert_eq!(request_id, Some(CommandId::from("b-7")));
        assert_eq!(result.command_id, CommandId::from("b-7"));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no eligible target surface"));

        drop(writer);
        drop(reader);
        session.await.unwrap().unwrap();
    }
}
