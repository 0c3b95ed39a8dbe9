//! Test infrastructure for convergence waits and reconciliations
//!
//! Provides:
//! - Scripted status probers with probe counters
//! - A scripted [`ResourceClient`](converge_common::ResourceClient) for orchestrator flows
//! - Wait spec and resource kind builders
//! - Outcome and phase verification helpers

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
