//! Backend-facing records: the ingestion body and persistent-link frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture::{Capture, SourceChannel};
use crate::command::{CommandAction, CommandId, CommandResult, SurfaceId};
use crate::pattern::DataCategory;

/// Body of `POST {base_url}{ingest_path}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestRecord {
    /// Normalized endpoint key.
    pub endpoint: String,
    pub url: String,
    pub method: String,
    pub payload: serde_json::Value,
    pub source_tag: SourceChannel,
    pub timestamp: DateTime<Utc>,
    pub data_category: DataCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl IngestRecord {
    pub fn from_capture(
        capture: &Capture,
        endpoint: impl Into<String>,
        data_category: DataCategory,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            url: capture.url.clone(),
            method: capture.method.clone(),
            payload: capture.body.clone(),
            source_tag: capture.source_channel,
            timestamp: capture.captured_at,
            data_category,
            delegate_to: None,
            context_id: capture.context_id.clone(),
        }
    }

    pub fn with_delegate(mut self, delegate_to: Option<String>) -> Self {
        self.delegate_to = delegate_to;
        self
    }
}

/// Lines the backend sends over the persistent link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendInbound {
    /// Ask the relay to run a command in a host page.
    Command {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command_id: Option<CommandId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        surface: Option<SurfaceId>,
        #[serde(flatten)]
        action: CommandAction,
    },
    Ping,
}

/// Lines the relay sends over the persistent link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendOutbound {
    Hello {
        instance_id: String,
        version: String,
    },
    CommandResult {
        /// The id the backend used, which may differ from the relay's own.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<CommandId>,
        #[serde(flatten)]
        result: CommandResult,
    },
    Pong,
}
