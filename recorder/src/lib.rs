//! Browser-side capture for pagetap.
//!
//! Two paths into a monitored page, both over the Chrome DevTools Protocol:
//! the [`page_hook`] installs the interception script and carries envelopes
//! in and out of the page, and the [`recorder::TrafficRecorder`] follows the
//! page's network traffic from the debugger side.

use std::time::Duration;

use pagetap_protocol::SurfaceId;
use thiserror::Error;

pub mod cdp;
pub mod lifecycle;
pub mod page_hook;
pub mod recorder;

pub use lifecycle::RecorderState;
pub use recorder::{AttachOutcome, DebugSession, DebugTarget, NetworkEvent, TrafficRecorder};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder busy: attached to {attached}, requested {requested}")]
    Busy {
        attached: SurfaceId,
        requested: SurfaceId,
    },

    #[error("surface {0} not found")]
    SurfaceNotFound(SurfaceId),

    #[error("recorder detached while attaching")]
    NotAttached,

    #[error("devtools endpoint unavailable: {0}")]
    Discovery(String),

    #[error("devtools protocol error: {0}")]
    Cdp(String),

    #[error("body retrieval failed: {0}")]
    Body(String),

    #[error("body retrieval timed out after {0:?}")]
    BodyTimeout(Duration),
}
