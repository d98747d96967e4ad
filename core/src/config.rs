//! pagetap configuration loading
//!
//! Loads `~/.config/pagetap/pagetap.toml` (or the file named by
//! `PAGETAP_CONFIG`). Every field has a default, so a missing file yields a
//! working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::OverflowPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid matcher pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PagetapConfig {
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// Which URLs are worth capturing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// A URL must match at least one of these regexes.
    #[serde(default = "default_include_patterns")]
    pub include: Vec<String>,
    /// A URL matching any of these is never captured.
    #[serde(default = "default_exclude_patterns")]
    pub exclude: Vec<String>,
    /// When non-empty, only these hosts (exact or dot-suffix match) are captured.
    #[serde(default)]
    pub hosts: Vec<String>,
}

fn default_include_patterns() -> Vec<String> {
    [
        r"/chart/",
        r"/patients?/",
        r"/api/",
        r"/data(\?|/|$)",
        r"(?i)(medication|allerg|problem|vital|lab|immuniz|encounter|order|note|document)",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_exclude_patterns() -> Vec<String> {
    [
        r"(?i)\.(js|mjs|css|png|jpe?g|gif|svg|ico|woff2?|ttf|map)(\?|$)",
        r"(?i)/(analytics|telemetry|metrics|beacon|heartbeat)(/|\?|$)",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            include: default_include_patterns(),
            exclude: default_exclude_patterns(),
            hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ingest_path")]
    pub ingest_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// `host:port` of the persistent command link. Disabled when unset.
    #[serde(default)]
    pub link_addr: Option<String>,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_ingest_path() -> String {
    "/ingest".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_reconnect_min_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ingest_path: default_ingest_path(),
            health_path: default_health_path(),
            request_timeout_ms: default_request_timeout_ms(),
            health_interval_secs: default_health_interval_secs(),
            link_addr: None,
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_command_timeout_secs() -> u64 {
    30
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// External classifier settings. Rules are always available as fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_classifier_timeout_ms")]
    pub timeout_ms: u64,
    /// Ask the classifier for a schema when an endpoint is first discovered.
    #[serde(default = "default_infer_schema")]
    pub infer_schema: bool,
    /// Minimum rule confidence before a category other than `unknown` is assigned.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_api_key_env() -> String {
    "PAGETAP_CLASSIFIER_KEY".to_string()
}

fn default_classifier_timeout_ms() -> u64 {
    3_000
}

fn default_infer_schema() -> bool {
    true
}

fn default_min_confidence() -> f32 {
    0.3
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_api_key_env(),
            timeout_ms: default_classifier_timeout_ms(),
            infer_schema: default_infer_schema(),
            min_confidence: default_min_confidence(),
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry document. Defaults to `<data dir>/pagetap/endpoints.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("pagetap").join("endpoints.json"))
            .unwrap_or_else(|| PathBuf::from("pagetap-endpoints.json"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Overrides the default socket path.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    /// Capacity of in-process channels between sandboxes.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_debug_port")]
    pub debug_port: u16,
    /// Substring a page URL must contain to be an eligible surface.
    #[serde(default)]
    pub surface_filter: Option<String>,
    /// Also attach the full-fidelity traffic recorder to the first surface.
    #[serde(default)]
    pub record_traffic: bool,
    #[serde(default = "default_body_timeout_ms")]
    pub body_timeout_ms: u64,
}

fn default_debug_port() -> u16 {
    9222
}

fn default_body_timeout_ms() -> u64 {
    5_000
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            debug_port: default_debug_port(),
            surface_filter: None,
            record_traffic: false,
            body_timeout_ms: default_body_timeout_ms(),
        }
    }
}

impl PagetapConfig {
    /// Environment variable overriding the config file path.
    pub const ENV_CONFIG_PATH: &'static str = "PAGETAP_CONFIG";

    pub const DEFAULT_CONFIG_FILENAME: &'static str = "pagetap.toml";

    /// Load from the resolved path, falling back to defaults when absent.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::resolve_config_path();
        if !path.exists() {
            tracing::info!(path = %path.display(), "pagetap config not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let cfg: PagetapConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("pagetap")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        nonzero("queue.capacity", self.queue.capacity as u64)?;
        nonzero("backend.health_interval_secs", self.backend.health_interval_secs)?;
        nonzero("backend.request_timeout_ms", self.backend.request_timeout_ms)?;
        nonzero("backend.reconnect_min_ms", self.backend.reconnect_min_ms)?;
        nonzero("commands.timeout_secs", self.commands.timeout_secs)?;
        nonzero("classifier.timeout_ms", self.classifier.timeout_ms)?;
        nonzero("relay.channel_capacity", self.relay.channel_capacity as u64)?;

        if self.backend.reconnect_max_ms < self.backend.reconnect_min_ms {
            return Err(ConfigError::Invalid {
                field: "backend.reconnect_max_ms",
                reason: "must not be below reconnect_min_ms".to_string(),
            });
        }
        if url::Url::parse(&self.backend.base_url).is_err() {
            return Err(ConfigError::Invalid {
                field: "backend.base_url",
                reason: format!("{:?} is not a URL", self.backend.base_url),
            });
        }

        // Compiles every pattern; errors name the offending one.
        crate::matcher::PatternMatcher::from_config(&self.matcher)?;

        if self.classifier.endpoint.is_none() && self.classifier.infer_schema {
            tracing::debug!("no classifier endpoint configured; schema inference disabled");
        }
        Ok(())
    }
}
