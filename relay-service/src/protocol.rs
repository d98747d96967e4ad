//! Socket protocol types for the relay service.
//!
//! Framing and error codes live in `pagetap_protocol::jsonrpc`; this module
//! adds the method names and the parameter/result shapes.

use pagetap_protocol::{CommandAction, EndpointPattern, Envelope, StatusSnapshot, SurfaceId};
use serde::{Deserialize, Serialize};

pub use pagetap_protocol::jsonrpc::{
    ERR_COMMAND_TIMEOUT, ERR_INFRA, ERR_INVALID_PARAMS, ERR_INVALID_REQUEST,
    ERR_MALFORMED_ENVELOPE, ERR_METHOD_NOT_FOUND, ERR_NO_SURFACE, ERR_TRANSPORT,
};

// ─────────────────────────────────────────────────────────────────────────────
// Method names
// ─────────────────────────────────────────────────────────────────────────────

pub const METHOD_HELLO: &str = "hello";
pub const METHOD_BRIDGE_ENVELOPE: &str = "bridge.envelope";
pub const METHOD_COMMAND_ISSUE: &str = "command.issue";
pub const METHOD_SERVICE_STATUS: &str = "service.status";
pub const METHOD_REGISTRY_LIST: &str = "registry.list";
pub const METHOD_QUEUE_DRAIN: &str = "queue.drain";

/// Relay → bridge push carrying a sealed command envelope.
pub const NOTIFY_BRIDGE_COMMAND: &str = "bridge.command";

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Issues requests only.
    #[default]
    Client,
    /// Forwards page envelopes and executes `bridge.command` pushes.
    Bridge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
    #[serde(default)]
    pub role: ClientRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    /// Changes whenever the relay restarts.
    pub instance_id: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// bridge.envelope / bridge.command
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEnvelopeParams {
    pub envelope: Envelope,
}

// ─────────────────────────────────────────────────────────────────────────────
// command.issue
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandIssueParams {
    /// Omit to let the relay pick the first eligible surface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface: Option<SurfaceId>,
    #[serde(flatten)]
    pub action: CommandAction,
}

// ─────────────────────────────────────────────────────────────────────────────
// service.status / registry.list
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
    pub bridges: usize,
    pub surfaces: Vec<SurfaceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryListResult {
    pub endpoints: Vec<EndpointPattern>,
}
