//! Resource-kind registry.
//!
//! Maps a kind name to the behavior the orchestrator needs for it: the
//! client, wait specs per operation, the diff, error classification and an
//! optional drain step. Built once at start-up and shared by reference.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::ResourceClient;
use crate::config::{OperationTimeouts, ReconcilerConfig};
use crate::diff::ConfigDiff;
use crate::error::{ConvergeError, ConvergeResult, DefaultClassifier, ErrorClassifier};
use crate::status::Attributes;
use crate::wait::WaitSpec;

/// Wait spec templates per operation phase.
///
/// Timeouts inside the templates are placeholders: the orchestrator
/// replaces them with the operation's remaining budget.
#[derive(Debug, Clone)]
pub struct WaitProfile {
    /// Wait after create until the resource is ready.
    pub create: WaitSpec,
    /// Wait after each update group, and the no-op drift check.
    pub update: WaitSpec,
    /// Wait after the delete call until the resource is gone.
    pub delete: WaitSpec,
}

/// Mutation that takes a resource out of its active state before deletion.
#[derive(Debug, Clone)]
pub struct DrainStep {
    /// Attributes sent with the disable call (e.g. `state = DISABLED`).
    pub attrs: Attributes,
    /// Wait after the disable call.
    pub wait: WaitSpec,
}

/// Everything the orchestrator needs to manage one kind of resource.
#[derive(Clone)]
pub struct ResourceKind {
    /// Registry key.
    pub name: String,
    /// Remote API for this kind.
    pub client: Arc<dyn ResourceClient>,
    /// Wait spec templates.
    pub waits: WaitProfile,
    /// Desired-vs-observed diff.
    pub diff: Arc<dyn ConfigDiff>,
    /// Transient/fatal classification of this API's errors.
    pub classifier: Arc<dyn ErrorClassifier>,
    /// Optional disable-before-delete step.
    pub drain: Option<DrainStep>,
    /// Operation budgets.
    pub timeouts: OperationTimeouts,
}

impl std::fmt::Debug for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceKind")
            .field("name", &self.name)
            .field("waits", &self.waits)
            .field("drain", &self.drain)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl ResourceKind {
    /// Creates a kind with the default classifier, no drain step and
    /// default timeouts.
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ResourceClient>,
        waits: WaitProfile,
        diff: Arc<dyn ConfigDiff>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            waits,
            diff,
            classifier: Arc::new(DefaultClassifier),
            drain: None,
            timeouts: OperationTimeouts::default(),
        }
    }

    /// Sets the error classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets the drain step run before deletion.
    pub fn with_drain(mut self, drain: DrainStep) -> Self {
        self.drain = Some(drain);
        self
    }

    /// Sets operation budgets.
    pub fn with_timeouts(mut self, timeouts: OperationTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Kind name to [`ResourceKind`] mapping.
#[derive(Debug, Default)]
pub struct Registry {
    kinds: HashMap<String, ResourceKind>,
    probe_error_limit: Option<u32>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kind, returning the one it replaced.
    pub fn register(&mut self, kind: ResourceKind) -> Option<ResourceKind> {
        info!(kind = %kind.name, "registering resource kind");
        let previous = self.kinds.insert(kind.name.clone(), kind);
        if let Some(ref prev) = previous {
            warn!(kind = %prev.name, "resource kind registered twice, replacing");
        }
        previous
    }

    /// Looks up a kind.
    pub fn get(&self, name: &str) -> ConvergeResult<&ResourceKind> {
        self.kinds.get(name).ok_or_else(|| ConvergeError::UnknownKind {
            kind: name.to_string(),
        })
    }

    /// Registered kind names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns true if no kind is registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Ceiling on consecutive transient probe errors applied to every wait.
    pub fn probe_error_limit(&self) -> Option<u32> {
        self.probe_error_limit
    }

    /// Applies timeout overrides and the probe error ceiling from `config`.
    pub fn apply_config(&mut self, config: &ReconcilerConfig) {
        self.probe_error_limit = config.max_transient_probe_errors;
        for kind in self.kinds.values_mut() {
            kind.timeouts = config.timeouts_for(&kind.name, kind.timeouts);
            info!(
                kind = %kind.name,
                create = ?kind.timeouts.create,
                update = ?kind.timeouts.update,
                delete = ?kind.timeouts.delete,
                "applied timeouts"
            );
        }
    }
}
