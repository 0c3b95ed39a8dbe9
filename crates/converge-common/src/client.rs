//! Remote API seam: the calls a resource kind must provide.
//!
//! Implementations own the transport and are shared between concurrent
//! reconciliations, so they must be `Send + Sync`.

use std::fmt;

use async_trait::async_trait;

use crate::status::{Attributes, ObservedState, ResourceKey, Status};

/// Kind of mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutationOp {
    /// Create the resource.
    Create,
    /// Update one mutation group.
    Update {
        /// Name of the mutation group being applied.
        group: String,
    },
    /// Move the resource out of its active state ahead of deletion.
    Disable,
    /// Delete the resource.
    Delete,
}

impl MutationOp {
    /// Returns true for [`MutationOp::Delete`].
    pub fn is_delete(&self) -> bool {
        matches!(self, MutationOp::Delete)
    }

    /// Returns true if a not-found rejection means the call's goal is
    /// already met (the resource is gone).
    pub fn tolerates_absence(&self) -> bool {
        matches!(self, MutationOp::Disable | MutationOp::Delete)
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationOp::Create => f.write_str("create"),
            MutationOp::Update { group } => write!(f, "update[{group}]"),
            MutationOp::Disable => f.write_str("disable"),
            MutationOp::Delete => f.write_str("delete"),
        }
    }
}

/// Desired attributes plus the identity of the target resource.
///
/// Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRequest {
    /// Target resource.
    pub key: ResourceKey,
    /// What kind of call to make.
    pub op: MutationOp,
    /// Attributes to send.
    pub attrs: Attributes,
}

impl MutationRequest {
    /// Creates a request.
    pub fn new(key: ResourceKey, op: MutationOp, attrs: Attributes) -> Self {
        Self { key, op, attrs }
    }

    /// A create request with the full desired attribute set.
    pub fn create(key: ResourceKey, attrs: Attributes) -> Self {
        Self::new(key, MutationOp::Create, attrs)
    }

    /// An update request for one mutation group.
    pub fn update(key: ResourceKey, group: impl Into<String>, attrs: Attributes) -> Self {
        Self::new(
            key,
            MutationOp::Update {
                group: group.into(),
            },
            attrs,
        )
    }

    /// A disable request carrying the attributes that drain the resource.
    pub fn disable(key: ResourceKey, attrs: Attributes) -> Self {
        Self::new(key, MutationOp::Disable, attrs)
    }

    /// A delete request.
    pub fn delete(key: ResourceKey) -> Self {
        Self::new(key, MutationOp::Delete, Attributes::new())
    }
}

/// What the remote API returned for a successful mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationAck {
    /// Remote identifier assigned or confirmed by the call.
    pub id: Option<String>,
    /// Status reported in the mutation response, if any.
    pub initial_status: Option<Status>,
    /// The resource was already gone (delete of a missing resource).
    pub already_absent: bool,
}

impl MutationAck {
    /// Acknowledgement carrying a remote identifier.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Sets the initial status.
    pub fn status(mut self, status: impl Into<Status>) -> Self {
        self.initial_status = Some(status.into());
        self
    }

    /// Acknowledgement for a delete whose target no longer exists.
    pub fn gone() -> Self {
        Self {
            already_absent: true,
            ..Self::default()
        }
    }
}

/// Remote API for one resource kind.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetches the current state of one resource; `Ok(None)` when it does
    /// not exist. Must not mutate remote state.
    async fn describe(&self, key: &ResourceKey) -> anyhow::Result<Option<ObservedState>>;

    /// Issues exactly one mutating call.
    async fn mutate(&self, request: &MutationRequest) -> anyhow::Result<MutationAck>;
}
