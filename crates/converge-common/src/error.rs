//! Error taxonomy and classification.
//!
//! Remote failures cross into the core as [`anyhow::Error`] and are sorted
//! into [`ErrorClass::Transient`] or [`ErrorClass::Fatal`] by an
//! [`ErrorClassifier`]. Everything the core reports back to its caller is a
//! [`ConvergeError`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::status::Status;

/// Result type alias for convergence operations.
pub type ConvergeResult<T> = Result<T, ConvergeError>;

/// Whether a failure is expected to clear up if the call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network, timeout or throttling failure; safe to retry.
    Transient,
    /// Validation, conflict or missing dependency; needs intervention.
    Fatal,
}

/// Errors surfaced by the waiter, dispatcher and orchestrator.
#[derive(Debug, Clone, Error)]
pub enum ConvergeError {
    /// Transient probe errors exceeded the configured ceiling.
    #[error("Status probe for {key} kept failing ({count} consecutive transient errors): {message}")]
    TransientProbe {
        /// Resource being probed.
        key: String,
        /// Consecutive transient failures observed.
        count: u32,
        /// Last error message.
        message: String,
    },

    /// The status probe failed permanently.
    #[error("Status probe for {key} failed: {message}")]
    FatalProbe {
        /// Resource being probed.
        key: String,
        /// Error message.
        message: String,
    },

    /// A mutation kept failing transiently until its attempt ceiling.
    #[error("{operation} of {key} failed after {attempts} attempts: {message}")]
    TransientMutation {
        /// Resource being mutated.
        key: String,
        /// Mutation kind (create, update, ...).
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Last error message.
        message: String,
    },

    /// A mutation was rejected permanently.
    #[error("{operation} of {key} rejected: {message}")]
    FatalMutation {
        /// Resource being mutated.
        key: String,
        /// Mutation kind (create, update, ...).
        operation: String,
        /// Error message.
        message: String,
    },

    /// The remote object reached a status outside both pending and target sets.
    #[error("Unexpected status '{status}' for {key} (expected {expected})")]
    UnexpectedStatus {
        /// Resource being waited on.
        key: String,
        /// Status that was observed.
        status: Status,
        /// Target statuses, rendered as `A|B`.
        expected: String,
    },

    /// The remote object disappeared during a wait that does not expect it.
    #[error("{key} disappeared while waiting for {expected}")]
    UnexpectedAbsence {
        /// Resource being waited on.
        key: String,
        /// Target statuses, rendered as `A|B`.
        expected: String,
    },

    /// The wait budget was exhausted before reaching a target status.
    #[error("Timed out after {elapsed:?} waiting for {key} (last status: {})", display_last(.last_status))]
    Timeout {
        /// Resource being waited on.
        key: String,
        /// Time spent.
        elapsed: Duration,
        /// Last status observed, if any.
        last_status: Option<Status>,
    },

    /// The caller cancelled the operation.
    #[error("Cancelled while reconciling {key} (last status: {})", display_last(.last_status))]
    Cancelled {
        /// Resource being reconciled.
        key: String,
        /// Last status observed, if any.
        last_status: Option<Status>,
    },

    /// A wait specification violated its invariants.
    #[error("Invalid wait specification: {message}")]
    InvalidWaitSpec {
        /// What is wrong with it.
        message: String,
    },

    /// The desired attributes describe a transition the remote API cannot make.
    #[error("Invalid update for {key}: {message}")]
    InvalidUpdate {
        /// Resource being updated.
        key: String,
        /// Error message.
        message: String,
    },

    /// No resource kind with this name is registered.
    #[error("Unknown resource kind '{kind}'")]
    UnknownKind {
        /// The kind that was requested.
        kind: String,
    },
}

fn display_last(last: &Option<Status>) -> String {
    last.as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl ConvergeError {
    /// Creates a fatal probe error from a remote failure.
    pub fn fatal_probe(key: impl fmt::Display, err: &anyhow::Error) -> Self {
        Self::FatalProbe {
            key: key.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// Creates a fatal mutation error from a remote failure.
    pub fn fatal_mutation(
        key: impl fmt::Display,
        operation: impl Into<String>,
        err: &anyhow::Error,
    ) -> Self {
        Self::FatalMutation {
            key: key.to_string(),
            operation: operation.into(),
            message: format!("{err:#}"),
        }
    }

    /// Creates an invalid wait specification error.
    pub fn invalid_wait_spec(message: impl Into<String>) -> Self {
        Self::InvalidWaitSpec {
            message: message.into(),
        }
    }

    /// Creates an invalid update error.
    pub fn invalid_update(key: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::InvalidUpdate {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(key: impl fmt::Display, last_status: Option<Status>) -> Self {
        Self::Cancelled {
            key: key.to_string(),
            last_status,
        }
    }

    /// Returns the transient/fatal classification of this error.
    ///
    /// Timeouts and cancellations are transient: resubmitting the same
    /// operation later may succeed without anyone fixing anything.
    pub fn classification(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvergeError::TransientProbe { .. }
                | ConvergeError::TransientMutation { .. }
                | ConvergeError::Timeout { .. }
                | ConvergeError::Cancelled { .. }
        )
    }

    /// Returns true if the remote system may still converge on its own.
    pub fn may_still_converge(&self) -> bool {
        matches!(
            self,
            ConvergeError::Timeout { .. } | ConvergeError::Cancelled { .. }
        )
    }

    /// Returns true if someone has to fix something before a retry can work.
    pub fn requires_intervention(&self) -> bool {
        self.classification() == ErrorClass::Fatal
    }

    /// Short stable label for reporting layers.
    pub fn label(&self) -> &'static str {
        match self {
            ConvergeError::TransientProbe { .. } => "transient_probe_error",
            ConvergeError::FatalProbe { .. } => "fatal_probe_error",
            ConvergeError::TransientMutation { .. } => "transient_mutation_error",
            ConvergeError::FatalMutation { .. } => "fatal_mutation_error",
            ConvergeError::UnexpectedStatus { .. } => "unexpected_status",
            ConvergeError::UnexpectedAbsence { .. } => "unexpected_absence",
            ConvergeError::Timeout { .. } => "timeout",
            ConvergeError::Cancelled { .. } => "cancelled",
            ConvergeError::InvalidWaitSpec { .. } => "invalid_wait_spec",
            ConvergeError::InvalidUpdate { .. } => "invalid_update",
            ConvergeError::UnknownKind { .. } => "unknown_kind",
        }
    }
}

/// A remote API error carrying a service error code.
///
/// Resource clients wrap service failures in this type (inside an
/// [`anyhow::Error`]) so the [`DefaultClassifier`] can read the code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    /// Service error code (e.g. "ThrottlingException").
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Creates a new API error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Service error codes treated as transient.
pub const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "RequestTimeout",
    "RequestTimeoutException",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalFailure",
    "ServerException",
];

/// Service error codes meaning the resource does not exist.
pub const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "NotFoundException",
    "NotFound",
];

/// Maps remote failures to [`ErrorClass`].
pub trait ErrorClassifier: Send + Sync {
    /// Classifies a remote failure.
    fn classify(&self, err: &anyhow::Error) -> ErrorClass;

    /// Returns true if the failure says the resource does not exist.
    ///
    /// A delete that fails this way has already reached its goal.
    fn is_not_found(&self, _err: &anyhow::Error) -> bool {
        false
    }
}

/// Classifier that understands [`ApiError`] codes and transport-level I/O errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, err: &anyhow::Error) -> ErrorClass {
        for cause in err.chain() {
            if let Some(api) = cause.downcast_ref::<ApiError>() {
                return if TRANSIENT_CODES.contains(&api.code.as_str()) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                };
            }
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                return match io_err.kind() {
                    io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock => ErrorClass::Transient,
                    _ => ErrorClass::Fatal,
                };
            }
            if cause.is::<tokio::time::error::Elapsed>() {
                return ErrorClass::Transient;
            }
        }
        ErrorClass::Fatal
    }

    fn is_not_found(&self, err: &anyhow::Error) -> bool {
        err.chain()
            .filter_map(|cause| cause.downcast_ref::<ApiError>())
            .any(|api| NOT_FOUND_CODES.contains(&api.code.as_str()))
    }
}

/// Adapts a closure into an [`ErrorClassifier`].
pub struct FnClassifier<F>(pub F);

impl<F> ErrorClassifier for FnClassifier<F>
where
    F: Fn(&anyhow::Error) -> ErrorClass + Send + Sync,
{
    fn classify(&self, err: &anyhow::Error) -> ErrorClass {
        (self.0)(err)
    }
}

/// Errors loading reconciler configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        /// Path that was read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The configuration is not valid YAML for the expected shape.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range.
    #[error("Invalid configuration for {field}: {message}")]
    Invalid {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid configuration error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}
