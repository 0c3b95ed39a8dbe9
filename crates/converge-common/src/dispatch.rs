//! Mutation dispatcher: issues one mutating call, classifies its result,
//! and optionally retries transient failures under a caller-supplied policy.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{MutationAck, MutationRequest, ResourceClient};
use crate::error::{ConvergeError, ConvergeResult, DefaultClassifier, ErrorClass, ErrorClassifier};
use crate::waiter::sleep_or_cancel;

/// How the delay between mutation attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Attempt ceiling and delay schedule for transient mutation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth of the delay.
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` is raised to 1 if zero.
    pub fn new(max_attempts: u32, strategy: BackoffStrategy, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            strategy,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, BackoffStrategy::Fixed, Duration::ZERO)
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retrying after `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        }
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, exponential backoff, 1s base delay.
    fn default() -> Self {
        Self::new(3, BackoffStrategy::Exponential, Duration::from_secs(1))
    }
}

/// Classified result of a single mutating call.
#[derive(Debug)]
pub enum MutationOutcome {
    /// The call was accepted.
    Applied(MutationAck),
    /// The call failed in a way that is safe to retry.
    Transient(anyhow::Error),
    /// The call failed permanently.
    Fatal(anyhow::Error),
}

impl MutationOutcome {
    /// Returns true for [`MutationOutcome::Applied`].
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied(_))
    }
}

/// Sends mutations through a [`ResourceClient`] and classifies the result.
#[derive(Clone)]
pub struct MutationDispatcher {
    classifier: Arc<dyn ErrorClassifier>,
    retry: RetryPolicy,
}

impl Default for MutationDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(DefaultClassifier), RetryPolicy::default())
    }
}

impl std::fmt::Debug for MutationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationDispatcher")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl MutationDispatcher {
    /// Creates a dispatcher.
    pub fn new(classifier: Arc<dyn ErrorClassifier>, retry: RetryPolicy) -> Self {
        Self { classifier, retry }
    }

    /// The retry policy applied by [`dispatch`](Self::dispatch).
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Sends exactly one mutating call and classifies the result.
    ///
    /// A delete or disable rejected because the resource does not exist is
    /// reported as applied with [`MutationAck::gone`].
    pub async fn dispatch_once(
        &self,
        client: &dyn ResourceClient,
        request: &MutationRequest,
    ) -> MutationOutcome {
        match client.mutate(request).await {
            Ok(ack) => MutationOutcome::Applied(ack),
            Err(err) if request.op.tolerates_absence() && self.classifier.is_not_found(&err) => {
                info!(key = %request.key, op = %request.op, "target already gone");
                MutationOutcome::Applied(MutationAck::gone())
            }
            Err(err) => match self.classifier.classify(&err) {
                ErrorClass::Transient => MutationOutcome::Transient(err),
                ErrorClass::Fatal => MutationOutcome::Fatal(err),
            },
        }
    }

    /// Dispatches `request`, retrying transient failures up to the policy's
    /// attempt ceiling.
    pub async fn dispatch(
        &self,
        client: &dyn ResourceClient,
        request: &MutationRequest,
        cancel: &CancellationToken,
    ) -> ConvergeResult<MutationAck> {
        self.dispatch_within(client, request, cancel, None).await
    }

    /// Like [`dispatch`](Self::dispatch), but retry delays never run past
    /// `budget`. Once the budget is spent the last transient failure is
    /// reported.
    #[instrument(skip_all, fields(key = %request.key, op = %request.op))]
    pub async fn dispatch_within(
        &self,
        client: &dyn ResourceClient,
        request: &MutationRequest,
        cancel: &CancellationToken,
        budget: Option<Duration>,
    ) -> ConvergeResult<MutationAck> {
        let deadline = budget.map(|budget| Instant::now() + budget);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ConvergeError::cancelled(&request.key, None));
            }
            attempt += 1;
            debug!(attempt, "sending mutation");

            match self.dispatch_once(client, request).await {
                MutationOutcome::Applied(ack) => {
                    info!(attempt, id = ?ack.id, initial_status = ?ack.initial_status, "mutation accepted");
                    return Ok(ack);
                }
                MutationOutcome::Fatal(err) => {
                    error!(attempt, error = %format!("{err:#}"), "mutation rejected");
                    return Err(ConvergeError::fatal_mutation(
                        &request.key,
                        request.op.to_string(),
                        &err,
                    ));
                }
                MutationOutcome::Transient(err) => {
                    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                    if !self.retry.should_retry(attempt) || remaining.is_some_and(|r| r.is_zero()) {
                        error!(attempt, error = %format!("{err:#}"), "mutation retries exhausted");
                        return Err(exhausted(request, attempt, &err));
                    }
                    let mut delay = self.retry.delay_after(attempt);
                    if let Some(remaining) = remaining {
                        delay = delay.min(remaining);
                    }
                    warn!(attempt, ?delay, error = %format!("{err:#}"), "transient mutation error, retrying");
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(ConvergeError::cancelled(&request.key, None));
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        error!(attempt, "mutation budget spent while retrying");
                        return Err(exhausted(request, attempt, &err));
                    }
                }
            }
        }
    }
}

fn exhausted(request: &MutationRequest, attempts: u32, err: &anyhow::Error) -> ConvergeError {
    ConvergeError::TransientMutation {
        key: request.key.to_string(),
        operation: request.op.to_string(),
        attempts,
        message: format!("{err:#}"),
    }
}
