//! Scripted probes and clients
//!
//! A script is a list of [`Step`]s consumed one per call; the final step
//! repeats forever so a script like `[CREATING, VALID]` keeps answering
//! `VALID` after the wait is done.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use converge_common::{
    ApiError, Attributes, ConfigDiff, DrainStep, GroupedDiff, MutationAck, MutationRequest,
    ObservedState, OperationTimeouts, PollOutcome, Registry, ResourceClient, ResourceKey,
    ResourceKind, RetryPolicy, Reconciler, StatusProber, WaitProfile, WaitSpec,
};
use tokio_util::sync::CancellationToken;

/// Error code the default classifier treats as transient.
pub const THROTTLED: &str = "ThrottlingException";
/// Error code the default classifier treats as fatal.
pub const VALIDATION: &str = "ValidationException";
/// Error code the default classifier treats as not-found.
pub const NOT_FOUND: &str = "ResourceNotFoundException";

/// One scripted probe answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The resource exists with this status.
    Status(String),
    /// The resource does not exist.
    Absent,
    /// The probe fails with a throttling error.
    Transient,
    /// The probe fails with a validation error.
    Fatal,
}

impl Step {
    /// An existing resource with `status`.
    pub fn status(status: &str) -> Self {
        Step::Status(status.to_string())
    }

    fn observe(&self, key: &ResourceKey, attrs: &Attributes) -> anyhow::Result<Option<ObservedState>> {
        match self {
            Step::Status(status) => Ok(Some(ObservedState::present(
                key.clone(),
                status.as_str(),
                attrs.clone(),
            ))),
            Step::Absent => Ok(None),
            Step::Transient => Err(ApiError::new(THROTTLED, "rate exceeded").into()),
            Step::Fatal => Err(ApiError::new(VALIDATION, "malformed request").into()),
        }
    }
}

/// Builds a script from status labels; `None` means absent.
pub fn statuses(labels: &[Option<&str>]) -> Vec<Step> {
    labels
        .iter()
        .map(|label| match label {
            Some(status) => Step::status(status),
            None => Step::Absent,
        })
        .collect()
}

/// Ordered steps, the last one repeating.
#[derive(Debug, Default)]
pub struct Script {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
}

impl Script {
    /// Creates a script. An empty script answers [`Step::Absent`].
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    /// Takes the next step.
    pub fn next_step(&self) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        if steps.len() > 1 {
            steps.pop_front().unwrap_or(Step::Absent)
        } else {
            steps.front().cloned().unwrap_or(Step::Absent)
        }
    }

    /// Number of steps taken so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// [`StatusProber`] that answers from a [`Script`].
#[derive(Debug)]
pub struct ScriptedProber {
    key: ResourceKey,
    script: Script,
    cancel_after: Option<(u32, CancellationToken)>,
    latency: Duration,
}

impl ScriptedProber {
    /// Creates a prober for `key`.
    pub fn new(key: ResourceKey, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            key,
            script: Script::new(steps),
            cancel_after: None,
            latency: Duration::ZERO,
        }
    }

    /// Fires `token` while serving probe number `probe` (1-based).
    pub fn cancel_after(mut self, probe: u32, token: CancellationToken) -> Self {
        self.cancel_after = Some((probe, token));
        self
    }

    /// Makes each probe take `latency` of (tokio) time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Probes served so far.
    pub fn probes(&self) -> u32 {
        self.script.calls()
    }
}

#[async_trait]
impl StatusProber for ScriptedProber {
    async fn probe(&self) -> PollOutcome {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let step = self.script.next_step();
        if let Some((probe, token)) = &self.cancel_after {
            if self.script.calls() >= *probe {
                token.cancel();
            }
        }
        match step.observe(&self.key, &Attributes::new()) {
            Ok(Some(state)) => PollOutcome::Observed(state),
            Ok(None) => PollOutcome::Observed(ObservedState::absent(self.key.clone(), "NOT_FOUND")),
            Err(err) => PollOutcome::ProbeError(err),
        }
    }
}

/// Scripted answer to a mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutateStep {
    /// Accepted with this acknowledgement.
    Ack(MutationAck),
    /// Throttled.
    Transient,
    /// Rejected.
    Fatal,
    /// Rejected because the resource does not exist.
    NotFound,
}

/// [`ResourceClient`] whose describe answers come from a [`Script`] and
/// whose mutations are recorded.
///
/// Mutations answer from their own queue and are accepted with an empty
/// acknowledgement once it runs dry.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    describes: Script,
    attrs: Attributes,
    mutations: Mutex<VecDeque<MutateStep>>,
    requests: Mutex<Vec<MutationRequest>>,
}

impl ScriptedClient {
    /// Creates a client whose describe calls follow `steps`.
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            describes: Script::new(steps),
            ..Self::default()
        }
    }

    /// Attributes reported with every present observation.
    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    /// Queues answers for the next mutating calls.
    pub fn with_mutations(self, steps: impl IntoIterator<Item = MutateStep>) -> Self {
        self.mutations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(steps);
        self
    }

    /// Describe calls served so far.
    pub fn probes(&self) -> u32 {
        self.describes.calls()
    }

    /// Mutations received so far, in order.
    pub fn requests(&self) -> Vec<MutationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ResourceClient for ScriptedClient {
    async fn describe(&self, key: &ResourceKey) -> anyhow::Result<Option<ObservedState>> {
        self.describes.next_step().observe(key, &self.attrs)
    }

    async fn mutate(&self, request: &MutationRequest) -> anyhow::Result<MutationAck> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let step = self
            .mutations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(MutateStep::Ack(MutationAck::default()));
        match step {
            MutateStep::Ack(ack) => Ok(ack),
            MutateStep::Transient => Err(ApiError::new(THROTTLED, "rate exceeded").into()),
            MutateStep::Fatal => Err(ApiError::new(VALIDATION, "rejected").into()),
            MutateStep::NotFound => Err(ApiError::new(NOT_FOUND, "no such resource").into()),
        }
    }
}

/// Wait spec with one-second polling.
pub fn wait_spec(pending: &[&str], target: &[&str], timeout: Duration) -> WaitSpec {
    WaitSpec::builder(timeout)
        .pending(pending.iter().copied())
        .target(target.iter().copied())
        .poll_interval(Duration::from_secs(1))
        .build()
        .unwrap_or_else(|e| panic!("invalid fixture wait spec: {e}"))
}

/// Deletion-aware wait spec with one-second polling.
pub fn deletion_spec(pending: &[&str], timeout: Duration) -> WaitSpec {
    WaitSpec::builder(timeout)
        .pending(pending.iter().copied())
        .target(["DELETED"])
        .deletion_aware()
        .poll_interval(Duration::from_secs(1))
        .build()
        .unwrap_or_else(|e| panic!("invalid fixture wait spec: {e}"))
}

/// Diff with a `settings` group (`priority`) and a `state` group.
pub fn widget_diff() -> Arc<dyn ConfigDiff> {
    Arc::new(
        GroupedDiff::new()
            .group("settings", ["priority"])
            .group("state", ["state"]),
    )
}

/// A `widget` kind using the batch-style status vocabulary
/// (CREATING/UPDATING -> VALID, DISABLED/DELETING -> gone), with a
/// disable-before-delete drain step and `budget` for every operation.
pub fn widget_kind(client: Arc<dyn ResourceClient>, budget: Duration) -> ResourceKind {
    let waits = WaitProfile {
        create: wait_spec(&["CREATING", "UPDATING"], &["VALID"], budget),
        update: wait_spec(&["UPDATING"], &["VALID"], budget),
        delete: deletion_spec(&["DISABLED", "DELETING"], budget),
    };
    let mut drain_attrs = Attributes::new();
    drain_attrs.insert("state".to_string(), "DISABLED".into());

    ResourceKind::new("widget", client, waits, widget_diff())
        .with_drain(DrainStep {
            attrs: drain_attrs,
            wait: wait_spec(&["UPDATING"], &["VALID"], budget),
        })
        .with_timeouts(OperationTimeouts {
            create: budget,
            update: budget,
            delete: budget,
        })
}

/// Reconciler over a registry holding only [`widget_kind`].
pub fn widget_reconciler(client: Arc<dyn ResourceClient>, budget: Duration, retry: RetryPolicy) -> Reconciler {
    let mut registry = Registry::new();
    registry.register(widget_kind(client, budget));
    Reconciler::new(Arc::new(registry), retry)
}

/// Key of a `widget` resource.
pub fn widget(id: &str) -> ResourceKey {
    ResourceKey::new("widget", id)
}
