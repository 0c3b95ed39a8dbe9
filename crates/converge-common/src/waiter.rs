//! Convergence waiter: polls a status prober until the remote object
//! reaches a target status, fails, or the budget runs out.
//!
//! # Algorithm
//!
//! 1. Sleep the spec's initial delay, if any.
//! 2. Probe. Transient probe errors count as pending; fatal ones end the wait.
//! 3. An absent resource ends a deletion-aware wait successfully and fails
//!    any other wait once the not-found tolerance is exhausted.
//! 4. A target status ends the wait on first sighting (no debounce); a
//!    pending status continues it; any other status fails it.
//! 5. Between probes, sleep the policy's interval (capped by the remaining
//!    budget) and give up with `Timeout` once the budget is spent.
//!
//! Cancellation is observed during every sleep and every probe. Once the
//! token fires the wait returns `Cancelled`, whatever the probe said.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::ResourceClient;
use crate::error::{ConvergeError, ConvergeResult, DefaultClassifier, ErrorClass, ErrorClassifier};
use crate::status::{ObservedState, ResourceKey};
use crate::wait::WaitSpec;

/// Result of one probe. Never both an observation and an error.
#[derive(Debug)]
pub enum PollOutcome {
    /// The remote object (or its absence) was observed.
    Observed(ObservedState),
    /// The probe call failed.
    ProbeError(anyhow::Error),
}

/// Queries the remote system for one resource.
///
/// Must be safe to call repeatedly and must not mutate remote state.
#[async_trait]
pub trait StatusProber: Send + Sync {
    /// Observes the resource once.
    async fn probe(&self) -> PollOutcome;
}

/// Adapts a closure returning a future into a [`StatusProber`].
pub struct FnProber<F>(pub F);

#[async_trait]
impl<F, Fut> StatusProber for FnProber<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = PollOutcome> + Send + 'static,
{
    async fn probe(&self) -> PollOutcome {
        (self.0)().await
    }
}

/// Probes a resource through its kind's [`ResourceClient`].
pub struct ClientProber<'a> {
    client: &'a dyn ResourceClient,
    key: ResourceKey,
}

impl<'a> ClientProber<'a> {
    /// Status label given to not-found observations.
    pub const NOT_FOUND: &'static str = "NOT_FOUND";

    /// Creates a prober for `key`.
    pub fn new(client: &'a dyn ResourceClient, key: ResourceKey) -> Self {
        Self { client, key }
    }
}

#[async_trait]
impl StatusProber for ClientProber<'_> {
    async fn probe(&self) -> PollOutcome {
        match self.client.describe(&self.key).await {
            Ok(Some(state)) => PollOutcome::Observed(state),
            Ok(None) => PollOutcome::Observed(ObservedState::absent(
                self.key.clone(),
                Self::NOT_FOUND,
            )),
            Err(err) => PollOutcome::ProbeError(err),
        }
    }
}

/// Terminal result of a wait or of a whole reconciliation.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// A target status was reached (or the resource is confirmed gone).
    Success(ObservedState),
    /// The budget ran out; the remote system may still converge later.
    Timeout {
        /// Last observation before giving up.
        last: Option<ObservedState>,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The wait cannot succeed without intervention.
    Failed {
        /// What went wrong.
        error: ConvergeError,
        /// Last observation, if any.
        last: Option<ObservedState>,
    },
    /// The caller cancelled the wait.
    Cancelled {
        /// Last observation before cancellation.
        last: Option<ObservedState>,
    },
}

impl WaitOutcome {
    /// Returns true for [`WaitOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, WaitOutcome::Success(_))
    }

    /// Returns true for [`WaitOutcome::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitOutcome::Timeout { .. })
    }

    /// Returns true for [`WaitOutcome::Failed`].
    pub fn is_failed(&self) -> bool {
        matches!(self, WaitOutcome::Failed { .. })
    }

    /// Returns true for [`WaitOutcome::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitOutcome::Cancelled { .. })
    }

    /// The final observation for success, the last one otherwise.
    pub fn last_observed(&self) -> Option<&ObservedState> {
        match self {
            WaitOutcome::Success(state) => Some(state),
            WaitOutcome::Timeout { last, .. }
            | WaitOutcome::Failed { last, .. }
            | WaitOutcome::Cancelled { last } => last.as_ref(),
        }
    }

    /// Classification of a non-successful outcome.
    pub fn classification(&self) -> Option<ErrorClass> {
        match self {
            WaitOutcome::Success(_) => None,
            WaitOutcome::Timeout { .. } | WaitOutcome::Cancelled { .. } => {
                Some(ErrorClass::Transient)
            }
            WaitOutcome::Failed { error, .. } => Some(error.classification()),
        }
    }

    /// Short stable label for reporting layers.
    pub fn label(&self) -> &'static str {
        match self {
            WaitOutcome::Success(_) => "success",
            WaitOutcome::Timeout { .. } => "timeout",
            WaitOutcome::Failed { .. } => "failed",
            WaitOutcome::Cancelled { .. } => "cancelled",
        }
    }

    /// Converts into a `Result`, turning timeouts and cancellations into
    /// the matching [`ConvergeError`] variants.
    pub fn into_result(self, key: &ResourceKey) -> ConvergeResult<ObservedState> {
        match self {
            WaitOutcome::Success(state) => Ok(state),
            WaitOutcome::Timeout { last, elapsed } => Err(ConvergeError::Timeout {
                key: key.to_string(),
                elapsed,
                last_status: last.map(|s| s.status),
            }),
            WaitOutcome::Failed { error, .. } => Err(error),
            WaitOutcome::Cancelled { last } => {
                Err(ConvergeError::cancelled(key, last.map(|s| s.status)))
            }
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first. Returns false when
/// cancelled.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Generic polling engine.
///
/// Holds no per-call state: one waiter can serve any number of concurrent
/// waits.
#[derive(Clone)]
pub struct ConvergenceWaiter {
    classifier: Arc<dyn ErrorClassifier>,
}

impl Default for ConvergenceWaiter {
    fn default() -> Self {
        Self::new(Arc::new(DefaultClassifier))
    }
}

impl std::fmt::Debug for ConvergenceWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergenceWaiter").finish_non_exhaustive()
    }
}

impl ConvergenceWaiter {
    /// Creates a waiter that classifies probe errors with `classifier`.
    pub fn new(classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self { classifier }
    }

    /// Blocks (asynchronously) until `key` converges per `spec`.
    pub async fn wait(
        &self,
        key: &ResourceKey,
        prober: &dyn StatusProber,
        spec: &WaitSpec,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        self.wait_seeded(key, prober, spec, cancel, None).await
    }

    /// Like [`wait`](Self::wait), starting from a state already known from
    /// the mutation response. `seed` is reported as the last observation
    /// until the first probe replaces it.
    #[instrument(skip_all, fields(key = %key, expected = %spec.expected()))]
    pub async fn wait_seeded(
        &self,
        key: &ResourceKey,
        prober: &dyn StatusProber,
        spec: &WaitSpec,
        cancel: &CancellationToken,
        seed: Option<ObservedState>,
    ) -> WaitOutcome {
        let started = Instant::now();
        let mut last: Option<ObservedState> = seed;
        let mut probes: u32 = 0;
        let mut transient_errors: u32 = 0;
        let mut absent_seen: u32 = 0;

        if !spec.initial_delay().is_zero() {
            let delay = spec.initial_delay().min(spec.timeout());
            debug!(?delay, "delaying first probe");
            if !sleep_or_cancel(delay, cancel).await {
                info!("cancelled during initial delay");
                return WaitOutcome::Cancelled { last };
            }
            let elapsed = started.elapsed();
            if elapsed >= spec.timeout() {
                return timed_out(last, elapsed);
            }
        }

        loop {
            if probes > 0 {
                let elapsed = started.elapsed();
                if elapsed >= spec.timeout() {
                    return timed_out(last, elapsed);
                }
                let pause = spec.interval_after(probes).min(spec.timeout() - elapsed);
                if !sleep_or_cancel(pause, cancel).await {
                    info!(probes, "cancelled between probes");
                    return WaitOutcome::Cancelled { last };
                }
                let elapsed = started.elapsed();
                if elapsed >= spec.timeout() {
                    return timed_out(last, elapsed);
                }
            }

            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled { last };
            }
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(probes, "cancelled during probe");
                    return WaitOutcome::Cancelled { last };
                }
                outcome = prober.probe() => outcome,
            };
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled { last };
            }
            probes += 1;

            let state = match outcome {
                PollOutcome::ProbeError(err) => match self.classifier.classify(&err) {
                    ErrorClass::Fatal => {
                        error!(probes, error = %format!("{err:#}"), "status probe failed");
                        return WaitOutcome::Failed {
                            error: ConvergeError::fatal_probe(key, &err),
                            last,
                        };
                    }
                    ErrorClass::Transient => {
                        transient_errors += 1;
                        warn!(
                            probes,
                            transient_errors,
                            error = %format!("{err:#}"),
                            "transient status probe error, treating as pending"
                        );
                        if let Some(limit) = spec.max_transient_probe_errors() {
                            if transient_errors > limit {
                                return WaitOutcome::Failed {
                                    error: ConvergeError::TransientProbe {
                                        key: key.to_string(),
                                        count: transient_errors,
                                        message: format!("{err:#}"),
                                    },
                                    last,
                                };
                            }
                        }
                        continue;
                    }
                },
                PollOutcome::Observed(state) => state,
            };
            transient_errors = 0;

            if !state.exists {
                if spec.is_deletion_aware() {
                    info!(probes, "resource is gone");
                    return WaitOutcome::Success(ObservedState::absent(
                        key.clone(),
                        spec.absent_status(),
                    ));
                }
                absent_seen += 1;
                if absent_seen > spec.not_found_tolerance() {
                    error!(probes, "resource disappeared");
                    return WaitOutcome::Failed {
                        error: ConvergeError::UnexpectedAbsence {
                            key: key.to_string(),
                            expected: spec.expected(),
                        },
                        last,
                    };
                }
                debug!(probes, absent_seen, "resource not found yet");
                continue;
            }
            absent_seen = 0;

            debug!(probes, status = %state.status, "observed");
            if spec.is_target(&state.status) {
                info!(probes, status = %state.status, "reached target status");
                return WaitOutcome::Success(state);
            }
            if !spec.is_pending(&state.status) {
                error!(probes, status = %state.status, "unexpected status");
                return WaitOutcome::Failed {
                    error: ConvergeError::UnexpectedStatus {
                        key: key.to_string(),
                        status: state.status.clone(),
                        expected: spec.expected(),
                    },
                    last: Some(state),
                };
            }
            last = Some(state);
        }
    }
}

fn timed_out(last: Option<ObservedState>, elapsed: Duration) -> WaitOutcome {
    warn!(
        ?elapsed,
        last_status = last.as_ref().map(|s| s.status.as_str()).unwrap_or("none"),
        "timed out waiting for target status"
    );
    WaitOutcome::Timeout { last, elapsed }
}
