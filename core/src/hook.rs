//! Interception hook around the host's network primitive.
//!
//! [`InterceptingFetch`] wraps a [`HostFetch`] and reports each completed
//! exchange to a [`NetworkObserver`] after the inner call has produced its
//! result. The observer can neither change that result nor make the call
//! fail: it gets shared references, and a panic inside it is swallowed.
//!
//! The same module holds the host-side command executor, which runs commands
//! delivered by the bridge through the host's own (unwrapped) primitive.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use pagetap_async_utils::OrCancelExt;
use pagetap_protocol::{
    BridgeMessage, Capture, CommandAction, CommandRequest, CommandResult, Envelope, SourceChannel,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::matcher::PatternMatcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl HostRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("host fetch failed: {0}")]
pub struct HostFetchError(pub String);

/// The host's outbound network primitive.
#[async_trait]
pub trait HostFetch: Send + Sync {
    async fn fetch(&self, request: HostRequest) -> Result<HostResponse, HostFetchError>;
}

/// Notified after each successful host exchange. Must not block.
pub trait NetworkObserver: Send + Sync {
    fn on_response(&self, request: &HostRequest, response: &HostResponse);
}

/// A [`HostFetch`] that behaves exactly like `inner` and reports to `observer`.
pub struct InterceptingFetch<F, O> {
    inner: F,
    observer: O,
}

impl<F, O> InterceptingFetch<F, O> {
    pub fn new(inner: F, observer: O) -> Self {
        Self { inner, observer }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }
}

#[async_trait]
impl<F, O> HostFetch for InterceptingFetch<F, O>
where
    F: HostFetch,
    O: NetworkObserver,
{
    async fn fetch(&self, request: HostRequest) -> Result<HostResponse, HostFetchError> {
        let result = self.inner.fetch(request.clone()).await;
        if let Ok(response) = &result {
            let observed = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.observer.on_response(&request, response);
            }));
            if observed.is_err() {
                tracing::debug!(url = %request.url, "network observer panicked; ignored");
            }
        }
        result
    }
}

/// Default observer: turns matching structured responses into capture envelopes.
pub struct CaptureEmitter {
    matcher: Arc<PatternMatcher>,
    tx: mpsc::Sender<Envelope>,
    context_id: Option<String>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureEmitter {
    pub fn new(matcher: Arc<PatternMatcher>, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            matcher,
            tx,
            context_id: None,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Captures lost to a full or closed channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl NetworkObserver for CaptureEmitter {
    fn on_response(&self, request: &HostRequest, response: &HostResponse) {
        if !self.matcher.matches(&request.url) {
            return;
        }
        let Ok(body) = serde_json::from_str::<serde_json::Value>(&response.body) else {
            return;
        };
        if !(body.is_object() || body.is_array()) {
            return;
        }

        let mut capture = Capture::new(
            SourceChannel::PrimaryHook,
            &request.method,
            &request.url,
            response.status,
            body,
        );
        capture.context_id = self.context_id.clone();

        match self.tx.try_send(BridgeMessage::Capture(capture).seal()) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Run one command through the host's primitive.
pub async fn execute_command<F>(fetch: &F, request: CommandRequest) -> CommandResult
where
    F: HostFetch + ?Sized,
{
    let command_id = request.command_id;
    match request.action {
        CommandAction::Ping => CommandResult::ok(command_id, serde_json::json!({"pong": true})),
        CommandAction::FetchJson {
            url,
            method,
            headers,
            body,
        } => {
            let host_request = HostRequest {
                method,
                url,
                headers,
                body: body.map(|b| b.to_string()),
            };
            match fetch.fetch(host_request).await {
                Ok(response) => {
                    let status = response.status;
                    match serde_json::from_str::<serde_json::Value>(&response.body) {
                        Ok(data) if (200..300).contains(&status) => CommandResult {
                            status: Some(status),
                            ..CommandResult::ok(command_id, data)
                        },
                        Ok(_) => CommandResult {
                            status: Some(status),
                            ..CommandResult::failed(command_id, format!("http status {status}"))
                        },
                        Err(e) => CommandResult {
                            status: Some(status),
                            ..CommandResult::failed(command_id, format!("response was not JSON: {e}"))
                        },
                    }
                }
                Err(e) => CommandResult::failed(command_id, e.to_string()),
            }
        }
    }
}

/// Host-side loop: execute command envelopes and answer with result envelopes.
///
/// Each command runs on its own task so a slow fetch does not hold back the
/// next command.
pub async fn run_command_executor<F>(
    fetch: Arc<F>,
    mut commands: mpsc::Receiver<Envelope>,
    results: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) where
    F: HostFetch + ?Sized + 'static,
{
    while let Ok(Some(envelope)) = commands.recv().or_cancel(&cancel).await {
        let request = match envelope.open() {
            Ok(BridgeMessage::Command(request)) => request,
            Ok(other) => {
                tracing::debug!(kind = %other.kind(), "host ignored non-command envelope");
                continue;
            }
            Err(e) => {
                tracing::debug!(error = %e, "host dropped invalid command envelope");
                continue;
            }
        };
        let fetch = Arc::clone(&fetch);
        let results = results.clone();
        tokio::spawn(async move {
            let result = execute_command(fetch.as_ref(), request).await;
            let _ = results
                .send(BridgeMessage::CommandResult(result).seal())
                .await;
        });
    }
}
