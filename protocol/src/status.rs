//! Connection state and the relay status snapshot.

use serde::{Deserialize, Serialize};

/// Relay-to-backend connectivity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated pipeline counters. Individual failures are only counted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureCounters {
    pub captures_received: u64,
    pub captures_malformed: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
    pub commands_issued: u64,
    pub commands_resolved: u64,
    pub commands_timed_out: u64,
    pub commands_rejected: u64,
    pub late_results_discarded: u64,
    pub classifier_fallbacks: u64,
}

/// Everything `service.status` reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub instance_id: String,
    pub connection_state: ConnectionState,
    pub counters: CaptureCounters,
    /// Number of discovered endpoint patterns.
    pub endpoints: usize,
    pub queue_depth: usize,
    pub queue_dropped: u64,
    pub pending_commands: usize,
    pub uptime_secs: u64,
}
