//! Full-fidelity capture through a debugging-protocol attachment.
//!
//! The recorder attaches to one surface at a time, follows each network
//! request from `requestWillBeSent` to `loadingFinished`, and fetches the
//! response body once for requests the matcher accepts. Bodies that cannot
//! be fetched still produce a capture, annotated with the failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pagetap_async_utils::OrCancelExt;
use pagetap_core::PatternMatcher;
use pagetap_protocol::{BridgeMessage, Capture, Envelope, SourceChannel, SurfaceId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::RecorderError;
use crate::lifecycle::{AttachStep, FinishedRequest, Lifecycle, RecorderState, RequestTracker};

/// Network events of an attached surface, in the order the debugger emits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    RequestWillBeSent {
        request_id: String,
        url: String,
        method: String,
    },
    ResponseReceived {
        request_id: String,
        url: String,
        status: u16,
        mime_type: String,
    },
    LoadingFinished {
        request_id: String,
    },
    LoadingFailed {
        request_id: String,
        error_text: String,
    },
    /// The target went away or the debugger detached.
    Detached {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    pub body: String,
    pub base64_encoded: bool,
}

#[async_trait]
pub trait DebugSession: Send + Sync {
    async fn response_body(&self, request_id: &str) -> Result<ResponseBody, RecorderError>;
}

/// A live session plus the stream of its network events.
pub struct AttachedSession {
    pub session: Arc<dyn DebugSession>,
    pub events: mpsc::Receiver<NetworkEvent>,
}

#[async_trait]
pub trait DebugTarget: Send + Sync {
    /// Surfaces that can be attached to right now.
    async fn surfaces(&self) -> Result<Vec<SurfaceId>, RecorderError>;

    async fn attach(&self, surface: &SurfaceId) -> Result<AttachedSession, RecorderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    AlreadyAttached,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub captured: u64,
    pub body_failures: u64,
    pub skipped: u64,
    pub failed_loads: u64,
}

#[derive(Debug, Default)]
struct Counters {
    captured: AtomicU64,
    body_failures: AtomicU64,
    skipped: AtomicU64,
    failed_loads: AtomicU64,
}

/// State shared between the recorder handle and its session tasks.
struct Shared {
    matcher: Arc<PatternMatcher>,
    captures: mpsc::Sender<Envelope>,
    body_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
    counters: Counters,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TrafficRecorder {
    target: Arc<dyn DebugTarget>,
    shared: Arc<Shared>,
    session_cancel: Mutex<Option<CancellationToken>>,
}

impl TrafficRecorder {
    pub fn new(
        target: Arc<dyn DebugTarget>,
        matcher: Arc<PatternMatcher>,
        captures: mpsc::Sender<Envelope>,
        body_timeout: Duration,
    ) -> Self {
        Self {
            target,
            shared: Arc::new(Shared {
                matcher,
                captures,
                body_timeout,
                lifecycle: Mutex::new(Lifecycle::default()),
                counters: Counters::default(),
            }),
            session_cancel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.shared.lifecycle().state().clone()
    }

    pub async fn surfaces(&self) -> Result<Vec<SurfaceId>, RecorderError> {
        self.target.surfaces().await
    }

    fn replace_cancel(&self, token: Option<CancellationToken>) -> Option<CancellationToken> {
        let mut slot = self
            .session_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, token)
    }

    /// Attach to `surface`. A no-op when already attached to it; `Busy` when
    /// attached (or attaching) elsewhere.
    pub async fn attach(&self, surface: SurfaceId) -> Result<AttachOutcome, RecorderError> {
        let generation = match self.shared.lifecycle().begin_attach(&surface)? {
            AttachStep::AlreadyAttached => return Ok(AttachOutcome::AlreadyAttached),
            AttachStep::Proceed(generation) => generation,
        };
        tracing::debug!(%surface, "attaching recorder");

        let attached = match self.target.attach(&surface).await {
            Ok(attached) => attached,
            Err(e) => {
                self.shared.lifecycle().finish_attach(generation, false);
                tracing::warn!(%surface, error = %e, "recorder attach failed");
                return Err(e);
            }
        };
        if !self.shared.lifecycle().finish_attach(generation, true) {
            return Err(RecorderError::NotAttached);
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = self.replace_cancel(Some(cancel.clone())) {
            previous.cancel();
        }
        tokio::spawn(run_session(
            Arc::clone(&self.shared),
            attached,
            surface.clone(),
            generation,
            cancel,
        ));
        tracing::info!(%surface, "recorder attached");
        Ok(AttachOutcome::Attached)
    }

    /// Detach from the current surface, cancelling in-flight body retrievals.
    pub fn detach(&self) -> Option<SurfaceId> {
        if let Some(cancel) = self.replace_cancel(None) {
            cancel.cancel();
        }
        let surface = self.shared.lifecycle().detach();
        if let Some(surface) = &surface {
            tracing::info!(%surface, "recorder detached");
        }
        surface
    }

    pub fn stats(&self) -> RecorderStats {
        let c = &self.shared.counters;
        RecorderStats {
            captured: c.captured.load(Ordering::Relaxed),
            body_failures: c.body_failures.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failed_loads: c.failed_loads.load(Ordering::Relaxed),
        }
    }
}

impl Drop for TrafficRecorder {
    fn drop(&mut self) {
        if let Some(cancel) = self.replace_cancel(None) {
            cancel.cancel();
        }
    }
}

async fn run_session(
    shared: Arc<Shared>,
    attached: AttachedSession,
    surface: SurfaceId,
    generation: u64,
    cancel: CancellationToken,
) {
    let AttachedSession {
        session,
        mut events,
    } = attached;
    let mut tracker = RequestTracker::default();

    let reason = loop {
        let event = match events.recv().or_cancel(&cancel).await {
            Ok(Some(event)) => event,
            Ok(None) => break "event stream closed".to_string(),
            Err(_) => break "detach requested".to_string(),
        };
        match event {
            NetworkEvent::RequestWillBeSent {
                request_id,
                url,
                method,
            } => tracker.on_request_sent(&request_id, &url, &method),
            NetworkEvent::ResponseReceived {
                request_id,
                url,
                status,
                mime_type,
            } => {
                if tracker.on_response(&request_id, &url, status, &mime_type) {
                    dispatch_finished(&shared, &session, &mut tracker, &request_id, &surface, &cancel);
                }
            }
            NetworkEvent::LoadingFinished { request_id } => {
                if tracker.on_finished(&request_id) {
                    dispatch_finished(&shared, &session, &mut tracker, &request_id, &surface, &cancel);
                }
            }
            NetworkEvent::LoadingFailed {
                request_id,
                error_text,
            } => {
                if tracker.on_failed(&request_id).is_some() {
                    shared.counters.failed_loads.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%request_id, %error_text, "request failed, dropped");
                }
            }
            NetworkEvent::Detached { reason } => break reason,
        }
    };

    cancel.cancel();
    let abandoned = tracker.clear();
    if let Some(surface) = shared.lifecycle().detach_generation(generation) {
        tracing::info!(%surface, %reason, abandoned, "recorder session ended");
    }
}

/// Claim the one body retrieval of a finished request and start it when the
/// matcher accepts the URL.
fn dispatch_finished(
    shared: &Arc<Shared>,
    session: &Arc<dyn DebugSession>,
    tracker: &mut RequestTracker,
    request_id: &str,
    surface: &SurfaceId,
    cancel: &CancellationToken,
) {
    let Some(finished) = tracker.claim_body(request_id) else {
        return;
    };
    tracker.complete(request_id);
    if !shared.matcher.matches(&finished.url) {
        shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    tokio::spawn(retrieve_body(
        Arc::clone(shared),
        Arc::clone(session),
        finished,
        surface.clone(),
        cancel.child_token(),
    ));
}

async fn retrieve_body(
    shared: Arc<Shared>,
    session: Arc<dyn DebugSession>,
    finished: FinishedRequest,
    surface: SurfaceId,
    cancel: CancellationToken,
) {
    let timeout = shared.body_timeout;
    let fetched = tokio::time::timeout(timeout, session.response_body(&finished.request_id))
        .or_cancel(&cancel)
        .await;
    let body = match fetched {
        Err(_) => {
            tracing::debug!(request_id = %finished.request_id, "body retrieval cancelled");
            return;
        }
        Ok(Err(_elapsed)) => Err(RecorderError::BodyTimeout(timeout)),
        Ok(Ok(result)) => result.and_then(|raw| decode_body(&raw)),
    };

    let capture = match body {
        Ok(body) => Capture::new(
            SourceChannel::DebugRecorder,
            finished.method,
            finished.url,
            finished.status,
            body,
        ),
        Err(e) => {
            shared.counters.body_failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(url = %finished.url, error = %e, "forwarding capture without body");
            Capture::new(
                SourceChannel::DebugRecorder,
                finished.method,
                finished.url,
                finished.status,
                Value::Null,
            )
            .with_body_error(e.to_string())
        }
    }
    .with_context(surface.as_str());

    if shared
        .captures
        .send(BridgeMessage::Capture(capture).seal())
        .await
        .is_ok()
    {
        shared.counters.captured.fetch_add(1, Ordering::Relaxed);
    }
}

/// Base64-decode when flagged, then parse as JSON, falling back to a string.
pub fn decode_body(raw: &ResponseBody) -> Result<Value, RecorderError> {
    let text = if raw.base64_encoded {
        let bytes = STANDARD
            .decode(raw.body.as_bytes())
            .map_err(|e| RecorderError::Body(format!("invalid base64: {e}")))?;
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        raw.body.clone()
    };
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
