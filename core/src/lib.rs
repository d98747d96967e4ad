//! Root of the `pagetap-core` library.
//!
//! The interception-and-relay pipeline: URL matching and normalization, the
//! endpoint registry, the context bridge, the delivery queue, command
//! orchestration, classification and the relay process that owns them.

// Library code reports through `tracing`, never stdout/stderr.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod backend;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod delegator;
pub mod error;
pub mod hook;
pub mod matcher;
pub mod normalize;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod relay;

pub use bridge::{ContextBridge, HostPort, PortError, RelayPort};
pub use config::{ConfigError, PagetapConfig};
pub use error::{ErrorCategory, PipelineError, Result};
pub use matcher::PatternMatcher;
pub use normalize::{NormalizedEndpoint, normalize};
pub use orchestrator::{CommandError, CommandOrchestrator, CommandTransport, TargetSurfaces};
pub use queue::{DeliveryQueue, DrainReport, OverflowPolicy};
pub use registry::{EndpointRegistry, Observation, RegistryStore};
pub use relay::{CaptureReceipt, DeliveryPath, HealthReport, RelayDeps, RelayProcess, RelaySettings};
