//! Attachment state machine and per-request tracking.

use std::collections::HashMap;

use pagetap_protocol::SurfaceId;

use crate::RecorderError;

/// `Detached → Attaching → Attached → Detached`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RecorderState {
    #[default]
    Detached,
    Attaching(SurfaceId),
    Attached(SurfaceId),
}

impl RecorderState {
    pub fn surface(&self) -> Option<&SurfaceId> {
        match self {
            RecorderState::Detached => None,
            RecorderState::Attaching(s) | RecorderState::Attached(s) => Some(s),
        }
    }
}

/// What [`Lifecycle::begin_attach`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStep {
    /// Go ahead and open a session; the value is the new generation.
    Proceed(u64),
    /// Already attached to this surface.
    AlreadyAttached,
}

/// Exclusive attachment bookkeeping.
///
/// Every attach gets a generation number so a session that ends late cannot
/// detach a newer one.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: RecorderState,
    generation: u64,
}

impl Lifecycle {
    pub fn state(&self) -> &RecorderState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn begin_attach(&mut self, surface: &SurfaceId) -> Result<AttachStep, RecorderError> {
        match &self.state {
            RecorderState::Attached(current) if current == surface => Ok(AttachStep::AlreadyAttached),
            RecorderState::Attached(current) | RecorderState::Attaching(current) => {
                Err(RecorderError::Busy {
                    attached: current.clone(),
                    requested: surface.clone(),
                })
            }
            RecorderState::Detached => {
                self.generation += 1;
                self.state = RecorderState::Attaching(surface.clone());
                Ok(AttachStep::Proceed(self.generation))
            }
        }
    }

    /// Complete the attach started with `generation`. Returns `false` when a
    /// detach happened in between.
    pub fn finish_attach(&mut self, generation: u64, ok: bool) -> bool {
        if generation != self.generation {
            return false;
        }
        let RecorderState::Attaching(surface) = &self.state else {
            return false;
        };
        self.state = if ok {
            RecorderState::Attached(surface.clone())
        } else {
            RecorderState::Detached
        };
        ok
    }

    /// Detach whatever is current.
    pub fn detach(&mut self) -> Option<SurfaceId> {
        match std::mem::take(&mut self.state) {
            RecorderState::Detached => None,
            RecorderState::Attaching(s) | RecorderState::Attached(s) => Some(s),
        }
    }

    /// Detach only if `generation` is still the live session.
    pub fn detach_generation(&mut self, generation: u64) -> Option<SurfaceId> {
        if generation != self.generation {
            return None;
        }
        self.detach()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-request tracking
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Sent,
    ResponseReceived,
    LoadingFinished,
    BodyRetrieved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRequest {
    pub url: String,
    pub method: String,
    pub status: Option<u16>,
    pub mime_type: Option<String>,
    pub stage: RequestStage,
    /// `loadingFinished` arrived before the response.
    finish_pending: bool,
}

/// A finished request whose body may now be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedRequest {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub status: u16,
}

/// Requests of one attached surface, keyed by debugger request id.
#[derive(Debug, Default)]
pub struct RequestTracker {
    requests: HashMap<String, TrackedRequest>,
}

impl RequestTracker {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn get(&self, request_id: &str) -> Option<&TrackedRequest> {
        self.requests.get(request_id)
    }

    /// A redirect reuses the request id; the new URL replaces the old one.
    pub fn on_request_sent(&mut self, request_id: &str, url: &str, method: &str) {
        self.requests.insert(
            request_id.to_string(),
            TrackedRequest {
                url: url.to_string(),
                method: method.to_ascii_uppercase(),
                status: None,
                mime_type: None,
                stage: RequestStage::Sent,
                finish_pending: false,
            },
        );
    }

    /// Requests already in flight at attach time show up here first.
    ///
    /// Returns whether the request is now `LoadingFinished`, which happens
    /// when its `loadingFinished` event was seen first.
    pub fn on_response(
        &mut self,
        request_id: &str,
        url: &str,
        status: u16,
        mime_type: &str,
    ) -> bool {
        let entry = self
            .requests
            .entry(request_id.to_string())
            .or_insert_with(|| TrackedRequest {
                url: url.to_string(),
                method: "GET".to_string(),
                status: None,
                mime_type: None,
                stage: RequestStage::Sent,
                finish_pending: false,
            });
        if entry.stage != RequestStage::Sent {
            return false;
        }
        entry.status = Some(status);
        entry.mime_type = Some(mime_type.to_string());
        if entry.finish_pending {
            entry.stage = RequestStage::LoadingFinished;
            return true;
        }
        entry.stage = RequestStage::ResponseReceived;
        false
    }

    /// Returns whether the request moved to `LoadingFinished`.
    pub fn on_finished(&mut self, request_id: &str) -> bool {
        match self.requests.get_mut(request_id) {
            Some(entry) if entry.stage == RequestStage::ResponseReceived => {
                entry.stage = RequestStage::LoadingFinished;
                true
            }
            Some(entry) if entry.stage == RequestStage::Sent => {
                entry.finish_pending = true;
                false
            }
            _ => false,
        }
    }

    pub fn on_failed(&mut self, request_id: &str) -> Option<TrackedRequest> {
        self.requests.remove(request_id)
    }

    /// Claim the single body retrieval for a finished request.
    pub fn claim_body(&mut self, request_id: &str) -> Option<FinishedRequest> {
        let entry = self.requests.get_mut(request_id)?;
        if entry.stage != RequestStage::LoadingFinished {
            return None;
        }
        entry.stage = RequestStage::BodyRetrieved;
        Some(FinishedRequest {
            request_id: request_id.to_string(),
            url: entry.url.clone(),
            method: entry.method.clone(),
            status: entry.status.unwrap_or_default(),
        })
    }

    /// Forget a request once its capture has been emitted or skipped.
    pub fn complete(&mut self, request_id: &str) {
        self.requests.remove(request_id);
    }

    pub fn clear(&mut self) -> usize {
        let n = self.requests.len();
        self.requests.clear();
        n
    }
}
