//! The `{kind, version, payload}` envelope carried across sandbox boundaries.
//!
//! Envelopes are deliberately loose on the wire (`payload` is any JSON value)
//! and strict once opened: [`Envelope::open`] is the single place where a
//! payload's shape is checked for its `kind`. Code past that point works with
//! [`BridgeMessage`] and never re-validates.

use serde::{Deserialize, Serialize};

use crate::ENVELOPE_VERSION;
use crate::capture::{Capture, SourceChannel};
use crate::command::{CommandRequest, CommandResult, SurfaceId};

/// Errors raised while opening an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("unsupported envelope version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("unknown envelope kind: {0}")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: MessageKind, reason: String },
}

impl EnvelopeError {
    /// Whether this error means a capture payload was unusable.
    pub fn is_malformed_capture(&self) -> bool {
        matches!(
            self,
            EnvelopeError::MalformedPayload {
                kind: MessageKind::Capture,
                ..
            }
        )
    }
}

/// Discriminant of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Capture,
    Command,
    CommandResult,
    Surfaces,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Capture => "capture",
            MessageKind::Command => "command",
            MessageKind::CommandResult => "command_result",
            MessageKind::Surfaces => "surfaces",
        }
    }

    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "capture" => Some(MessageKind::Capture),
            "command" => Some(MessageKind::Command),
            "command_result" => Some(MessageKind::CommandResult),
            "surfaces" => Some(MessageKind::Surfaces),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw envelope as it travels between sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub version: u32,
    pub payload: serde_json::Value,
}

/// A validated envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    Capture(Capture),
    Command(CommandRequest),
    CommandResult(CommandResult),
    /// The surfaces a bridge can currently execute commands in.
    Surfaces(Vec<SurfaceId>),
}

impl Envelope {
    /// Parse a raw JSON string into an envelope without opening it.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Validate the payload for this envelope's kind.
    pub fn open(self) -> Result<BridgeMessage, EnvelopeError> {
        if self.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                found: self.version,
                expected: ENVELOPE_VERSION,
            });
        }
        let kind =
            MessageKind::parse(&self.kind).ok_or_else(|| EnvelopeError::UnknownKind(self.kind))?;

        match kind {
            MessageKind::Capture => open_capture(self.payload).map(BridgeMessage::Capture),
            MessageKind::Command => {
                let request: CommandRequest = decode(kind, self.payload)?;
                Ok(BridgeMessage::Command(request))
            }
            MessageKind::CommandResult => {
                let result: CommandResult = decode(kind, self.payload)?;
                if !result.success && result.error.is_none() {
                    return Err(malformed(kind, "failed result without error"));
                }
                Ok(BridgeMessage::CommandResult(result))
            }
            MessageKind::Surfaces => {
                let surfaces: Vec<SurfaceId> = decode(kind, self.payload)?;
                Ok(BridgeMessage::Surfaces(surfaces))
            }
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl BridgeMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            BridgeMessage::Capture(_) => MessageKind::Capture,
            BridgeMessage::Command(_) => MessageKind::Command,
            BridgeMessage::CommandResult(_) => MessageKind::CommandResult,
            BridgeMessage::Surfaces(_) => MessageKind::Surfaces,
        }
    }

    /// Wrap this message into a wire envelope.
    pub fn seal(&self) -> Envelope {
        let payload = match self {
            BridgeMessage::Capture(capture) => serde_json::to_value(capture),
            BridgeMessage::Command(request) => serde_json::to_value(request),
            BridgeMessage::CommandResult(result) => serde_json::to_value(result),
            BridgeMessage::Surfaces(surfaces) => serde_json::to_value(surfaces),
        }
        .unwrap_or(serde_json::Value::Null);

        Envelope {
            kind: self.kind().as_str().to_string(),
            version: ENVELOPE_VERSION,
            payload,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: MessageKind,
    payload: serde_json::Value,
) -> Result<T, EnvelopeError> {
    serde_json::from_value(payload).map_err(|e| malformed(kind, e.to_string()))
}

fn malformed(kind: MessageKind, reason: impl Into<String>) -> EnvelopeError {
    EnvelopeError::MalformedPayload {
        kind,
        reason: reason.into(),
    }
}

fn open_capture(payload: serde_json::Value) -> Result<Capture, EnvelopeError> {
    let kind = MessageKind::Capture;
    let capture: Capture = decode(kind, payload)?;

    if capture.method.trim().is_empty() {
        return Err(malformed(kind, "empty method"));
    }
    if !is_plausible_url(&capture.url) {
        return Err(malformed(kind, format!("unusable url {:?}", capture.url)));
    }
    // The primary hook only forwards structured responses; anything else
    // reaching this point was produced by a broken or foreign script.
    if capture.source_channel == SourceChannel::PrimaryHook && !capture.is_structured() {
        return Err(malformed(kind, "body is not structured data"));
    }

    // Size is derived, never trusted from the sender.
    let rebuilt = Capture::at(
        capture.source_channel,
        capture.method,
        capture.url,
        capture.status,
        capture.body,
        capture.captured_at,
    );
    Ok(Capture {
        context_id: capture.context_id,
        body_error: capture.body_error,
        ..rebuilt
    })
}

fn is_plausible_url(raw: &str) -> bool {
    if raw.starts_with('/') {
        return true;
    }
    url::Url::parse(raw).is_ok()
}
