//! Verification helpers for wait outcomes and reconciliations

use std::time::Duration;

use converge_common::{ConvergeError, ObservedState, Phase, Reconciliation, WaitOutcome};
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected outcome '{expected}', got '{actual}' ({detail})")]
    OutcomeMismatch {
        expected: &'static str,
        actual: &'static str,
        detail: String,
    },

    #[error("Expected status '{expected}', got '{actual}'")]
    StatusMismatch { expected: String, actual: String },

    #[error("Expected error '{expected}', got '{actual}'")]
    ErrorMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Expected phases {expected:?}, got {actual:?}")]
    PhaseMismatch {
        expected: Vec<Phase>,
        actual: Vec<Phase>,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

fn mismatch(expected: &'static str, actual: &WaitOutcome) -> VerificationError {
    VerificationError::OutcomeMismatch {
        expected,
        actual: actual.label(),
        detail: format!("{actual:?}"),
    }
}

fn check_status(state: Option<&ObservedState>, expected: Option<&str>) -> VerifyResult<()> {
    let actual = state.map(|s| s.status.as_str());
    if actual != expected {
        return Err(VerificationError::StatusMismatch {
            expected: expected.unwrap_or("none").to_string(),
            actual: actual.unwrap_or("none").to_string(),
        });
    }
    Ok(())
}

/// Verify that a wait succeeded with `status`.
pub fn verify_success<'a>(outcome: &'a WaitOutcome, status: &str) -> VerifyResult<&'a ObservedState> {
    match outcome {
        WaitOutcome::Success(state) => {
            check_status(Some(state), Some(status))?;
            Ok(state)
        }
        other => Err(mismatch("success", other)),
    }
}

/// Verify that a wait timed out with `last_status` as its last observation.
pub fn verify_timeout(outcome: &WaitOutcome, last_status: Option<&str>) -> VerifyResult<Duration> {
    match outcome {
        WaitOutcome::Timeout { last, elapsed } => {
            check_status(last.as_ref(), last_status)?;
            Ok(*elapsed)
        }
        other => Err(mismatch("timeout", other)),
    }
}

/// Verify that a wait failed with an error labelled `label`.
pub fn verify_failed<'a>(outcome: &'a WaitOutcome, label: &'static str) -> VerifyResult<&'a ConvergeError> {
    match outcome {
        WaitOutcome::Failed { error, .. } if error.label() == label => Ok(error),
        WaitOutcome::Failed { error, .. } => Err(VerificationError::ErrorMismatch {
            expected: label,
            actual: error.label(),
        }),
        other => Err(mismatch("failed", other)),
    }
}

/// Verify that a wait was cancelled.
pub fn verify_cancelled(outcome: &WaitOutcome) -> VerifyResult<()> {
    match outcome {
        WaitOutcome::Cancelled { .. } => Ok(()),
        other => Err(mismatch("cancelled", other)),
    }
}

/// Verify the full phase history of a reconciliation.
pub fn verify_phases(reconciliation: &Reconciliation, expected: &[Phase]) -> VerifyResult<()> {
    if reconciliation.phases != expected {
        return Err(VerificationError::PhaseMismatch {
            expected: expected.to_vec(),
            actual: reconciliation.phases.clone(),
        });
    }
    Ok(())
}
