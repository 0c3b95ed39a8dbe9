//! Name constants for the job queue resource kind.
//!
//! These match the batch service's API vocabulary.

/// Registry key of the job queue kind.
pub const JOB_QUEUE_KIND: &str = "job_queue";

/// Attribute names of a job queue.
pub mod fields {
    /// Queue name (immutable).
    pub const NAME: &str = "name";

    /// Scheduling priority.
    pub const PRIORITY: &str = "priority";

    /// Desired state, ENABLED or DISABLED.
    pub const STATE: &str = "state";

    /// Ordered compute environment ARNs.
    pub const COMPUTE_ENVIRONMENTS: &str = "compute_environments";

    /// Fair share scheduling policy ARN.
    pub const SCHEDULING_POLICY_ARN: &str = "scheduling_policy_arn";

    /// Queue ARN (computed).
    pub const ARN: &str = "arn";
}

/// Lifecycle statuses reported by the service.
pub mod status {
    pub const CREATING: &str = "CREATING";
    pub const UPDATING: &str = "UPDATING";
    pub const DELETING: &str = "DELETING";
    pub const DELETED: &str = "DELETED";
    pub const VALID: &str = "VALID";
    pub const INVALID: &str = "INVALID";
}

/// Values of the `state` attribute.
pub mod state {
    pub const ENABLED: &str = "ENABLED";
    pub const DISABLED: &str = "DISABLED";
}

/// Update groups, in the order they are applied.
pub mod groups {
    /// Priority, compute environments and scheduling policy.
    pub const SETTINGS: &str = "settings";

    /// Enabled/disabled state.
    pub const STATE: &str = "state";
}

/// Service error codes.
pub mod codes {
    /// Invalid request: validation, conflict, unknown queue.
    pub const CLIENT_EXCEPTION: &str = "ClientException";

    /// Internal service failure.
    pub const SERVER_EXCEPTION: &str = "ServerException";

    /// Request rate exceeded.
    pub const THROTTLING: &str = "ThrottlingException";
}

/// Most compute environments a queue can reference.
pub const MAX_COMPUTE_ENVIRONMENTS: usize = 3;
