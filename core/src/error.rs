//! Pipeline error taxonomy.
//!
//! Every failure in the pipeline is local: it is logged with its category,
//! counted, and the pipeline keeps running. Only configuration errors at
//! startup are fatal.

use pagetap_protocol::EnvelopeError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::delegator::ClassifierError;
use crate::orchestrator::CommandError;
use crate::registry::PersistenceError;

/// Error category for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The privileged channel is permanently gone.
    SandboxInvalidated,
    /// Backend unreachable; buffered and retried.
    NetworkUnavailable,
    /// A single capture or envelope failed validation and was dropped.
    MalformedCapture,
    /// A command passed its deadline.
    CommandTimeout,
    /// A command was refused before dispatch or could not be dispatched.
    CommandRejected,
    /// External classifier missing or failing; rules were used.
    ClassifierUnavailable,
    Config,
    Persistence,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SandboxInvalidated => "SANDBOX_INVALIDATED",
            Self::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            Self::MalformedCapture => "MALFORMED_CAPTURE",
            Self::CommandTimeout => "COMMAND_TIMEOUT",
            Self::CommandRejected => "COMMAND_REJECTED",
            Self::ClassifierUnavailable => "CLASSIFIER_UNAVAILABLE",
            Self::Config => "CONFIG_ERROR",
            Self::Persistence => "PERSISTENCE_ERROR",
        }
    }

    /// Whether the pipeline continues normally after this error.
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::Config)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("privileged channel invalidated: {0}")]
    SandboxInvalidated(String),

    #[error("backend unavailable: {0}")]
    NetworkUnavailable(#[from] BackendError),

    #[error("malformed capture: {0}")]
    MalformedCapture(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("{0} envelopes are not accepted here")]
    UnexpectedMessage(pagetap_protocol::MessageKind),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SandboxInvalidated(_) => ErrorCategory::SandboxInvalidated,
            Self::NetworkUnavailable(_) => ErrorCategory::NetworkUnavailable,
            Self::MalformedCapture(_) | Self::Envelope(_) | Self::UnexpectedMessage(_) => {
                ErrorCategory::MalformedCapture
            }
            Self::Command(CommandError::Timeout { .. }) => ErrorCategory::CommandTimeout,
            Self::Command(_) => ErrorCategory::CommandRejected,
            Self::Classifier(_) => ErrorCategory::ClassifierUnavailable,
            Self::Config(_) => ErrorCategory::Config,
            Self::Persistence(_) => ErrorCategory::Persistence,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
