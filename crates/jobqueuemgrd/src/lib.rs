//! Batch job queue manager.
//!
//! This crate implements the `jobqueuemgrd` daemon, which reconciles the
//! job queues of a batch service to a YAML manifest.
//!
//! # Responsibilities
//!
//! - Create missing queues and wait for them to become `VALID`
//! - Update changed queues one mutation group at a time (settings, then state)
//! - Disable, then delete queues on destroy, waiting for each step
//! - Report per-queue outcomes; a timeout is a warning, not an error
//!
//! # Statuses
//!
//! | Operation | Pending | Target |
//! |-----------|---------|--------|
//! | create | CREATING, UPDATING | VALID |
//! | update | UPDATING | VALID |
//! | disable | UPDATING | VALID |
//! | delete | DISABLED, DELETING | DELETED or gone |
//!
//! # Example
//!
//! ```ignore
//! use converge_jobqueuemgrd::{build_reconciler, JobQueueMgr, Manifest, SimulatedBatch};
//!
//! let reconciler = build_reconciler(Arc::new(SimulatedBatch::default()), &config)?;
//! let summary = JobQueueMgr::new(reconciler)
//!     .apply(&Manifest::from_file("queues.yaml")?, &cancel)
//!     .await;
//! ```

mod job_queue;
mod manifest;
mod mgr;
mod sim;
mod tables;

pub use job_queue::{
    drain_step, job_queue_kind, queue_key, validate_name, wait_profile, BatchClassifier,
    JobQueueDiff, JobQueueError, JobQueueSpec, QueueState,
};
pub use manifest::{Manifest, ManifestError};
pub use mgr::{build_reconciler, ApplySummary, JobQueueMgr};
pub use sim::{SimulatedBatch, DEFAULT_SETTLE_PROBES};
pub use tables::*;
