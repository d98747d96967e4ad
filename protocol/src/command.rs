//! Active commands: fetches issued by the relay and executed in the host page.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique id of an issued command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a target surface (a host page that can execute commands).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the host page should do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandAction {
    /// Fetch a URL with the page's ambient credentials and return the JSON body.
    FetchJson {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
    /// Liveness check answered directly by the installed hook.
    Ping,
}

fn default_method() -> String {
    "GET".to_string()
}

impl CommandAction {
    pub fn fetch(url: impl Into<String>) -> Self {
        CommandAction::FetchJson {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandAction::FetchJson { .. } => "fetch_json",
            CommandAction::Ping => "ping",
        }
    }
}

/// A command on its way to a host page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    pub command_id: CommandId,
    pub surface: SurfaceId,
    #[serde(flatten)]
    pub action: CommandAction,
}

/// The host page's answer to a [`CommandRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(command_id: CommandId, data: serde_json::Value) -> Self {
        Self {
            command_id,
            success: true,
            status: None,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(command_id: CommandId, error: impl Into<String>) -> Self {
        Self {
            command_id,
            success: false,
            status: None,
            data: None,
            error: Some(error.into()),
        }
    }
}
