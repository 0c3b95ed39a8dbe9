//! Convergence core for eventually-consistent remote resources.
//!
//! Remote APIs that accept a create, update or delete long before the
//! resource is actually usable need a caller that waits for the change to
//! land. This crate provides the pieces:
//!
//! - [`ConvergenceWaiter`]: polls a [`StatusProber`] until a target status,
//!   a failure, cancellation or the timeout
//! - [`MutationDispatcher`]: issues one mutating call and classifies the
//!   result as transient or fatal
//! - [`Reconciler`]: runs create/update/delete as dispatch-then-wait steps
//!   over a [`Registry`] of resource kinds
//!
//! # Architecture
//!
//! 1. A manager registers one [`ResourceKind`] per remote resource type
//! 2. Desired state is handed to the [`Reconciler`]
//! 3. Each mutation goes out through the dispatcher
//! 4. The waiter polls until the remote system reports convergence
//! 5. The result comes back as a [`Reconciliation`] with phases and diagnostics
//!
//! # Example
//!
//! ```ignore
//! use converge_common::{attrs, MutationRequest, Reconciler, ResourceKey};
//!
//! let reconciler = Reconciler::new(registry, RetryPolicy::default());
//! let key = ResourceKey::new("job_queue", "nightly");
//! let result = reconciler
//!     .create(MutationRequest::create(key, attrs! { "priority" => 1i64 }), &cancel)
//!     .await;
//! if !result.is_success() {
//!     for d in &result.diagnostics {
//!         tracing::warn!("{}: {}", d.summary, d.detail);
//!     }
//! }
//! ```

mod client;
mod config;
mod diff;
mod dispatch;
mod error;
mod orchestrator;
mod registry;
mod status;
mod wait;
mod waiter;

pub use client::{MutationAck, MutationOp, MutationRequest, ResourceClient};
pub use config::{
    OperationTimeouts, ReconcilerConfig, RetrySettings, TimeoutSettings, DEFAULT_OPERATION_TIMEOUT,
};
pub use diff::{ConfigDiff, GroupedDiff, MutationGroup};
pub use dispatch::{BackoffStrategy, MutationDispatcher, MutationOutcome, RetryPolicy};
pub use error::{
    ApiError, ConfigError, ConvergeError, ConvergeResult, DefaultClassifier, ErrorClass,
    ErrorClassifier, FnClassifier, NOT_FOUND_CODES, TRANSIENT_CODES,
};
pub use orchestrator::{Diagnostic, Operation, Phase, Reconciler, Reconciliation, Severity};
pub use registry::{DrainStep, Registry, ResourceKind, WaitProfile};
pub use status::{
    display_set, status_set, AttrValue, Attributes, AttributesExt, ObservedState, ResourceKey,
    Status, StatusSet,
};
pub use wait::{PollPolicy, WaitSpec, WaitSpecBuilder};
pub use waiter::{ClientProber, ConvergenceWaiter, FnProber, PollOutcome, StatusProber, WaitOutcome};
