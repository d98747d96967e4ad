//! Wire types shared by every pagetap sandbox.
//!
//! Everything in this crate is plain data: it is serialized at one sandbox
//! boundary and deserialized at the next, so values are always copied and
//! never shared.
//!
//! - [`capture`]: observed request/response pairs
//! - [`envelope`]: the `{kind, version, payload}` bridge envelope
//! - [`command`]: active commands and their results
//! - [`pattern`]: discovered endpoint patterns and data categories
//! - [`status`]: connection state and the status snapshot
//! - [`ingest`]: backend ingestion records and persistent-link messages
//! - [`jsonrpc`]: JSON-RPC-lite framing for the relay socket

pub mod capture;
pub mod command;
pub mod envelope;
pub mod ingest;
pub mod jsonrpc;
pub mod pattern;
pub mod status;

pub use capture::{Capture, SourceChannel};
pub use command::{CommandAction, CommandId, CommandRequest, CommandResult, SurfaceId};
pub use envelope::{BridgeMessage, Envelope, EnvelopeError, MessageKind};
pub use pattern::{DataCategory, EndpointPattern};
pub use status::{CaptureCounters, ConnectionState, StatusSnapshot};

/// Envelope schema version understood by this build.
pub const ENVELOPE_VERSION: u32 = 1;
