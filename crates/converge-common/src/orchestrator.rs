//! Reconciliation orchestrator.
//!
//! Drives one create, update or delete through the registered kind's
//! dispatcher and waiter:
//!
//! ```text
//! Requested -> Dispatched -> Waiting -> Succeeded
//!                  |            |
//!                  +------------+-----> Failed | TimedOut | Cancelled
//! ```
//!
//! Multi-step operations (update groups, drain then delete) repeat the
//! `Dispatched -> Waiting` pair per step. All steps of one operation share
//! the operation's time budget, and the first non-success aborts the
//! operation. Steps already applied are never rolled back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{MutationRequest, MutationOp};
use crate::dispatch::{MutationDispatcher, RetryPolicy};
use crate::error::{ConvergeError, ConvergeResult, ErrorClass};
use crate::registry::{Registry, ResourceKind};
use crate::status::{Attributes, ObservedState, ResourceKey, Status};
use crate::wait::WaitSpec;
use crate::waiter::{sleep_or_cancel, ClientProber, ConvergenceWaiter, WaitOutcome};

/// Operation requested of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// A lookup that decides between create and update.
    Read,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Read => "read",
        })
    }
}

/// State of a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Requested,
    Dispatched,
    Waiting,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl Phase {
    /// Returns true for the four terminal phases.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Succeeded | Phase::Failed | Phase::TimedOut | Phase::Cancelled
        )
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A note attached to a reconciliation result for the reporting layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
}

impl Diagnostic {
    fn new(severity: Severity, summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity,
            summary: summary.into(),
            detail: detail.into(),
        }
    }
}

/// Result of one orchestrated operation.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Resource identity. After a create this carries the identifier the
    /// remote API assigned.
    pub key: ResourceKey,
    /// What was requested.
    pub operation: Operation,
    /// Phase history, ending in a terminal phase.
    pub phases: Vec<Phase>,
    /// Notes for the reporting layer.
    pub diagnostics: Vec<Diagnostic>,
    /// Mutating calls accepted by the remote API.
    pub mutations: u32,
    /// Terminal outcome.
    pub outcome: WaitOutcome,
}

impl Reconciliation {
    /// Returns true if the operation converged.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// The terminal phase.
    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Requested)
    }

    /// Returns true if any diagnostic is an error.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Classification of a non-successful outcome.
    pub fn classification(&self) -> Option<ErrorClass> {
        self.outcome.classification()
    }

    /// A reconciliation that ended before any mutation was sent.
    ///
    /// A [`ConvergeError::Cancelled`] error ends in `Cancelled`, anything
    /// else in `Failed`.
    pub fn rejected(key: ResourceKey, operation: Operation, error: ConvergeError) -> Self {
        let outcome = match error {
            ConvergeError::Cancelled { .. } => WaitOutcome::Cancelled { last: None },
            error => WaitOutcome::Failed { error, last: None },
        };
        Run::new(key, operation, Duration::ZERO).finish(outcome)
    }

    /// Converts into a `Result` over the final observation.
    pub fn into_result(self) -> ConvergeResult<ObservedState> {
        self.outcome.into_result(&self.key)
    }
}

/// Book-keeping for one operation in flight.
struct Run {
    key: ResourceKey,
    operation: Operation,
    phases: Vec<Phase>,
    diagnostics: Vec<Diagnostic>,
    mutations: u32,
    started: Instant,
    deadline: Instant,
}

impl Run {
    fn new(key: ResourceKey, operation: Operation, budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            key,
            operation,
            phases: vec![Phase::Requested],
            diagnostics: Vec::new(),
            mutations: 0,
            started,
            deadline: started + budget,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(key = %self.key, operation = %self.operation, ?phase, "phase transition");
        self.phases.push(phase);
    }

    fn note(&mut self, severity: Severity, summary: impl Into<String>, detail: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(severity, summary, detail));
    }

    /// Budget left for the next step, or `None` once spent.
    fn remaining(&self) -> Option<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    fn budget_spent(&self, last: Option<ObservedState>) -> WaitOutcome {
        WaitOutcome::Timeout {
            last,
            elapsed: self.started.elapsed(),
        }
    }

    fn finish(mut self, outcome: WaitOutcome) -> Reconciliation {
        let op = self.operation;
        match &outcome {
            WaitOutcome::Success(state) => {
                self.enter(Phase::Succeeded);
                info!(key = %self.key, operation = %op, status = %state.status, mutations = self.mutations, "reconciled");
            }
            WaitOutcome::Timeout { last, elapsed } => {
                self.enter(Phase::TimedOut);
                let status = last_status(last.as_ref());
                warn!(key = %self.key, operation = %op, ?elapsed, %status, "reconciliation timed out");
                self.note(
                    Severity::Warning,
                    format!("{op} of {} timed out", self.key),
                    format!(
                        "gave up after {elapsed:?} with last status {status}; the remote system may still converge"
                    ),
                );
            }
            WaitOutcome::Failed { error, .. } => {
                self.enter(Phase::Failed);
                error!(key = %self.key, operation = %op, error = %error, kind = error.label(), "reconciliation failed");
                self.note(
                    Severity::Error,
                    format!("{op} of {} failed", self.key),
                    error.to_string(),
                );
            }
            WaitOutcome::Cancelled { last } => {
                self.enter(Phase::Cancelled);
                let status = last_status(last.as_ref());
                warn!(key = %self.key, operation = %op, %status, "reconciliation cancelled");
                self.note(
                    Severity::Warning,
                    format!("{op} of {} cancelled", self.key),
                    format!("last status {status}"),
                );
            }
        }
        Reconciliation {
            key: self.key,
            operation: op,
            phases: self.phases,
            diagnostics: self.diagnostics,
            mutations: self.mutations,
            outcome,
        }
    }
}

fn last_status(last: Option<&ObservedState>) -> &str {
    last.map(|s| s.status.as_str()).unwrap_or("none")
}

/// Fills in the last known observation when a step failed before seeing
/// the resource itself.
fn with_fallback(outcome: WaitOutcome, fallback: Option<ObservedState>) -> WaitOutcome {
    match outcome {
        WaitOutcome::Timeout { last: None, elapsed } => WaitOutcome::Timeout {
            last: fallback,
            elapsed,
        },
        WaitOutcome::Failed { error, last: None } => WaitOutcome::Failed {
            error,
            last: fallback,
        },
        WaitOutcome::Cancelled { last: None } => WaitOutcome::Cancelled { last: fallback },
        other => other,
    }
}

/// Runs create, update, delete and read against registered resource kinds.
///
/// Holds no per-call state; clones share the registry, and concurrent
/// reconciliations of distinct resources do not interfere.
#[derive(Clone)]
pub struct Reconciler {
    registry: Arc<Registry>,
    retry: RetryPolicy,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("kinds", &self.registry.names())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Reconciler {
    /// Creates a reconciler over `registry`, retrying transient mutation
    /// failures per `retry`.
    pub fn new(registry: Arc<Registry>, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    /// The registry in use.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Creates a resource and waits until it reaches a ready status.
    #[instrument(skip_all, fields(key = %request.key))]
    pub async fn create(
        &self,
        request: MutationRequest,
        cancel: &CancellationToken,
    ) -> Reconciliation {
        let kind = match self.registry.get(&request.key.kind) {
            Ok(kind) => kind,
            Err(error) => return Reconciliation::rejected(request.key, Operation::Create, error),
        };
        let mut run = Run::new(request.key.clone(), Operation::Create, kind.timeouts.create);
        info!(budget = ?kind.timeouts.create, "creating");

        let outcome = match self
            .step(kind, &mut run, &request, &kind.waits.create, cancel)
            .await
        {
            Ok(state) => WaitOutcome::Success(state),
            Err(outcome) => outcome,
        };
        run.finish(outcome)
    }

    /// Moves an existing resource from `observed` to `desired`.
    ///
    /// Each changed mutation group is dispatched and awaited in declared
    /// order. With nothing to change, the current status is re-confirmed
    /// instead, so a resource stuck in a non-target status is reported.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn update(
        &self,
        key: &ResourceKey,
        desired: &Attributes,
        observed: &ObservedState,
        cancel: &CancellationToken,
    ) -> Reconciliation {
        let kind = match self.registry.get(&key.kind) {
            Ok(kind) => kind,
            Err(error) => return Reconciliation::rejected(key.clone(), Operation::Update, error),
        };
        let mut run = Run::new(key.clone(), Operation::Update, kind.timeouts.update);

        let groups = match kind.diff.diff(desired, &observed.attrs) {
            Ok(groups) => groups,
            Err(error) => {
                return run.finish(WaitOutcome::Failed {
                    error,
                    last: Some(observed.clone()),
                })
            }
        };

        if groups.is_empty() {
            info!("no changes, confirming current status");
            run.note(Severity::Info, "no changes", format!("{key} already matches"));
            let outcome = match self.confirm(kind, &mut run, key, &kind.waits.update, cancel, None).await {
                Ok(state) => WaitOutcome::Success(state),
                Err(outcome) => with_fallback(outcome, Some(observed.clone())),
            };
            return run.finish(outcome);
        }

        info!(groups = groups.len(), budget = ?kind.timeouts.update, "updating");
        let mut last = observed.clone();
        for group in groups {
            debug!(group = %group.name, fields = group.attrs.len(), "applying mutation group");
            let request = MutationRequest::update(key.clone(), group.name, group.attrs);
            match self
                .step(kind, &mut run, &request, &kind.waits.update, cancel)
                .await
            {
                Ok(state) => last = state,
                Err(outcome) => return run.finish(with_fallback(outcome, Some(last))),
            }
        }
        run.finish(WaitOutcome::Success(last))
    }

    /// Deletes a resource and waits until it is gone.
    ///
    /// Kinds with a drain step are disabled and awaited first. A resource
    /// that is already gone counts as deleted.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete(&self, key: &ResourceKey, cancel: &CancellationToken) -> Reconciliation {
        let kind = match self.registry.get(&key.kind) {
            Ok(kind) => kind,
            Err(error) => return Reconciliation::rejected(key.clone(), Operation::Delete, error),
        };
        let mut run = Run::new(key.clone(), Operation::Delete, kind.timeouts.delete);
        info!(budget = ?kind.timeouts.delete, drain = kind.drain.is_some(), "deleting");

        let mut last = None;
        if let Some(drain) = &kind.drain {
            let request = MutationRequest::disable(key.clone(), drain.attrs.clone());
            match self.step(kind, &mut run, &request, &drain.wait, cancel).await {
                Ok(state) if !state.exists => {
                    run.note(Severity::Info, "already deleted", format!("{key} was not found"));
                    return run.finish(WaitOutcome::Success(state));
                }
                Ok(state) => last = Some(state),
                Err(outcome) => return run.finish(outcome),
            }
        }

        let request = MutationRequest::delete(key.clone());
        let outcome = match self
            .step(kind, &mut run, &request, &kind.waits.delete, cancel)
            .await
        {
            Ok(state) => WaitOutcome::Success(state),
            Err(outcome) => with_fallback(outcome, last),
        };
        run.finish(outcome)
    }

    /// Fetches the current state of a resource; `None` when it does not
    /// exist.
    ///
    /// Transient describe errors are retried under the reconciler's retry
    /// policy.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn read(
        &self,
        key: &ResourceKey,
        cancel: &CancellationToken,
    ) -> ConvergeResult<Option<ObservedState>> {
        let kind = self.registry.get(&key.kind)?;
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ConvergeError::cancelled(key, None));
            }
            attempt += 1;

            let err = match kind.client.describe(key).await {
                Ok(state) => return Ok(state.filter(|s| s.exists)),
                Err(err) if kind.classifier.is_not_found(&err) => return Ok(None),
                Err(err) => err,
            };
            match kind.classifier.classify(&err) {
                ErrorClass::Fatal => {
                    warn!(attempt, error = %format!("{err:#}"), "read failed");
                    return Err(ConvergeError::fatal_probe(key, &err));
                }
                ErrorClass::Transient if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(attempt, ?delay, error = %format!("{err:#}"), "transient read error, retrying");
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(ConvergeError::cancelled(key, None));
                    }
                }
                ErrorClass::Transient => {
                    warn!(attempt, error = %format!("{err:#}"), "read retries exhausted");
                    return Err(ConvergeError::TransientProbe {
                        key: key.to_string(),
                        count: attempt,
                        message: format!("{err:#}"),
                    });
                }
            }
        }
    }

    /// One `Dispatched -> Waiting` pair.
    async fn step(
        &self,
        kind: &ResourceKind,
        run: &mut Run,
        request: &MutationRequest,
        template: &WaitSpec,
        cancel: &CancellationToken,
    ) -> Result<ObservedState, WaitOutcome> {
        if run.remaining().is_none() {
            return Err(run.budget_spent(None));
        }

        let dispatcher = MutationDispatcher::new(kind.classifier.clone(), self.retry);
        let ack = match dispatcher
            .dispatch_within(kind.client.as_ref(), request, cancel, run.remaining())
            .await
        {
            Ok(ack) => ack,
            Err(ConvergeError::Cancelled { .. }) => return Err(WaitOutcome::Cancelled { last: None }),
            Err(error) => return Err(WaitOutcome::Failed { error, last: None }),
        };
        run.mutations += 1;
        run.enter(Phase::Dispatched);

        if ack.already_absent {
            info!(op = %request.op, "resource already gone");
            return Ok(ObservedState::absent(request.key.clone(), Status::deleted()));
        }

        let key = match (&request.op, &ack.id) {
            (MutationOp::Create, Some(id)) if *id != request.key.id => {
                let key = ResourceKey::new(request.key.kind.clone(), id.clone());
                info!(assigned = %key, "remote identifier assigned");
                run.key = key.clone();
                key
            }
            _ => request.key.clone(),
        };
        let seed = ack.initial_status.map(|status| {
            debug!(%status, "initial status from mutation response");
            ObservedState::present(key.clone(), status, request.attrs.clone())
        });

        self.confirm(kind, run, &key, template, cancel, seed).await
    }

    /// The `Waiting` half of a step, bounded by the run's remaining budget.
    async fn confirm(
        &self,
        kind: &ResourceKind,
        run: &mut Run,
        key: &ResourceKey,
        template: &WaitSpec,
        cancel: &CancellationToken,
        seed: Option<ObservedState>,
    ) -> Result<ObservedState, WaitOutcome> {
        let Some(budget) = run.remaining() else {
            return Err(run.budget_spent(seed));
        };
        let mut spec = match template.with_timeout(budget) {
            Ok(spec) => spec,
            Err(error) => return Err(WaitOutcome::Failed { error, last: seed }),
        };
        if let Some(limit) = self.registry.probe_error_limit() {
            spec = spec.with_transient_probe_limit(Some(limit));
        }

        run.enter(Phase::Waiting);
        let prober = ClientProber::new(kind.client.as_ref(), key.clone());
        let waiter = ConvergenceWaiter::new(kind.classifier.clone());
        match waiter.wait_seeded(key, &prober, &spec, cancel, seed).await {
            WaitOutcome::Success(state) => Ok(state),
            WaitOutcome::Timeout { last, .. } => Err(run.budget_spent(last)),
            other => Err(other),
        }
    }
}
