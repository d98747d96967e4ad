//! Async building blocks shared by the pagetap services.
//!
//! - [`OrCancelExt`] races any future against a `CancellationToken`; every
//!   long-running loop in the workspace stops through it.
//! - [`PendingRegistry`] / [`Deferred`] correlate an outbound request with an
//!   asynchronous reply under a fixed deadline.

mod cancel;
mod deferred;

pub use cancel::{CancelErr, OrCancelExt, sleep_or_cancel};
pub use deferred::{Deferred, DeferredError, DuplicateKey, PendingInfo, PendingRegistry};
