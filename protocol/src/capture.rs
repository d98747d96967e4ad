//! Captured request/response pairs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which capture path produced a [`Capture`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SourceChannel {
    /// The interception hook installed in the host page.
    PrimaryHook,
    /// The debugging-protocol traffic recorder.
    DebugRecorder,
}

impl SourceChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceChannel::PrimaryHook => "primary-hook",
            SourceChannel::DebugRecorder => "debug-recorder",
        }
    }
}

impl std::fmt::Display for SourceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed request/response pair judged relevant by the pattern matcher.
///
/// A capture is built once and then only moved or cloned; every sandbox hop
/// serializes it, so nothing downstream can observe a mutation made upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capture {
    pub source_channel: SourceChannel,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Set by the traffic recorder when the response body could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_error: Option<String>,
}

impl Capture {
    /// Build a capture stamped with the current time.
    pub fn new(
        source_channel: SourceChannel,
        method: impl Into<String>,
        url: impl Into<String>,
        status: u16,
        body: serde_json::Value,
    ) -> Self {
        Self::at(source_channel, method, url, status, body, Utc::now())
    }

    /// Build a capture with an explicit timestamp.
    pub fn at(
        source_channel: SourceChannel,
        method: impl Into<String>,
        url: impl Into<String>,
        status: u16,
        body: serde_json::Value,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let size_bytes = body_size(&body);
        Self {
            source_channel,
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            status,
            body,
            context_id: None,
            captured_at,
            size_bytes,
            body_error: None,
        }
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Annotate a capture whose body could not be retrieved.
    pub fn with_body_error(mut self, error: impl Into<String>) -> Self {
        self.body_error = Some(error.into());
        self
    }

    /// Whether the body is structured data (an object or an array).
    pub fn is_structured(&self) -> bool {
        self.body.is_object() || self.body.is_array()
    }
}

fn body_size(body: &serde_json::Value) -> u64 {
    match body {
        serde_json::Value::Null => 0,
        serde_json::Value::String(s) => s.len() as u64,
        other => serde_json::to_vec(other)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0),
    }
}
