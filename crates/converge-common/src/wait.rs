//! Wait specifications: which statuses to wait through, which to wait for,
//! and how long and how often to poll.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConvergeError, ConvergeResult};
use crate::status::{display_set, Status, StatusSet};

/// Interval policy between consecutive probes.
///
/// The policy is fixed for the lifetime of a [`WaitSpec`]; every interval
/// it produces is clamped to at least the spec's minimum poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPolicy {
    /// Always sleep `poll_interval`.
    #[default]
    Fixed,
    /// Start at `poll_interval` and double after every probe, up to `max_interval`.
    Exponential {
        /// Ceiling for the doubled interval.
        max_interval: Duration,
    },
}

/// Immutable description of one convergence wait.
///
/// Built through [`WaitSpec::builder`], which enforces that pending and
/// target sets are disjoint and that the timeout is positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSpec {
    pending: StatusSet,
    target: StatusSet,
    timeout: Duration,
    initial_delay: Duration,
    poll_interval: Duration,
    min_poll_interval: Duration,
    policy: PollPolicy,
    deletion_aware: bool,
    max_transient_probe_errors: Option<u32>,
    not_found_tolerance: u32,
}

impl WaitSpec {
    /// Starts a builder with the given timeout.
    pub fn builder(timeout: Duration) -> WaitSpecBuilder {
        WaitSpecBuilder::new(timeout)
    }

    /// Statuses that precede the target and are not errors.
    pub fn pending(&self) -> &StatusSet {
        &self.pending
    }

    /// Statuses that mean the wait is over.
    pub fn target(&self) -> &StatusSet {
        &self.target
    }

    /// Overall wall-clock budget, including the initial delay.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Delay before the first probe.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Base interval between probes.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Lower bound on every interval.
    pub fn min_poll_interval(&self) -> Duration {
        self.min_poll_interval
    }

    /// The interval policy.
    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Whether observing the resource as absent counts as reaching the target.
    pub fn is_deletion_aware(&self) -> bool {
        self.deletion_aware
    }

    /// Ceiling on consecutive transient probe errors; `None` leaves the
    /// timeout as the only bound.
    pub fn max_transient_probe_errors(&self) -> Option<u32> {
        self.max_transient_probe_errors
    }

    /// Consecutive not-found observations tolerated by a non-deletion wait.
    pub fn not_found_tolerance(&self) -> u32 {
        self.not_found_tolerance
    }

    /// Returns true if `status` is a pending status.
    pub fn is_pending(&self, status: &Status) -> bool {
        self.pending.contains(status)
    }

    /// Returns true if `status` is a target status.
    pub fn is_target(&self, status: &Status) -> bool {
        self.target.contains(status)
    }

    /// Status reported in the synthetic state produced when a
    /// deletion-aware wait sees the resource disappear.
    pub fn absent_status(&self) -> Status {
        self.target
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(Status::deleted)
    }

    /// Target set rendered for messages.
    pub fn expected(&self) -> String {
        if self.target.is_empty() {
            "absence".to_string()
        } else {
            display_set(&self.target)
        }
    }

    /// Interval to sleep after the `probes`-th probe (1-based).
    pub fn interval_after(&self, probes: u32) -> Duration {
        let base = match self.policy {
            PollPolicy::Fixed => self.poll_interval,
            PollPolicy::Exponential { max_interval } => {
                let exp = probes.saturating_sub(1).min(31);
                self.poll_interval
                    .checked_mul(1u32 << exp)
                    .unwrap_or(max_interval)
                    .min(max_interval)
            }
        };
        base.max(self.min_poll_interval)
    }

    /// Returns a copy of this spec with a different timeout.
    ///
    /// Used to hand each step of a multi-step operation the remaining budget.
    pub fn with_timeout(&self, timeout: Duration) -> ConvergeResult<WaitSpec> {
        if timeout.is_zero() {
            return Err(ConvergeError::invalid_wait_spec("timeout must be positive"));
        }
        Ok(WaitSpec {
            timeout,
            ..self.clone()
        })
    }

    /// Returns a copy of this spec with a transient probe error ceiling.
    pub fn with_transient_probe_limit(&self, limit: Option<u32>) -> WaitSpec {
        WaitSpec {
            max_transient_probe_errors: limit,
            ..self.clone()
        }
    }
}

/// Builder for [`WaitSpec`].
#[derive(Debug, Clone)]
pub struct WaitSpecBuilder {
    spec: WaitSpec,
}

impl WaitSpecBuilder {
    /// Default interval between probes.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

    /// Default lower bound on intervals.
    pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

    fn new(timeout: Duration) -> Self {
        Self {
            spec: WaitSpec {
                pending: StatusSet::new(),
                target: StatusSet::new(),
                timeout,
                initial_delay: Duration::ZERO,
                poll_interval: Self::DEFAULT_POLL_INTERVAL,
                min_poll_interval: Self::DEFAULT_MIN_POLL_INTERVAL,
                policy: PollPolicy::Fixed,
                deletion_aware: false,
                max_transient_probe_errors: None,
                not_found_tolerance: 0,
            },
        }
    }

    /// Sets the pending statuses.
    pub fn pending<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Status>,
    {
        self.spec.pending = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the target statuses.
    pub fn target<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Status>,
    {
        self.spec.target = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the delay before the first probe.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.spec.initial_delay = delay;
        self
    }

    /// Sets the base interval between probes.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.spec.poll_interval = interval;
        self
    }

    /// Sets the lower bound on intervals.
    pub fn min_poll_interval(mut self, interval: Duration) -> Self {
        self.spec.min_poll_interval = interval;
        self
    }

    /// Sets the interval policy.
    pub fn policy(mut self, policy: PollPolicy) -> Self {
        self.spec.policy = policy;
        self
    }

    /// Treats an absent resource as having reached the target.
    pub fn deletion_aware(mut self) -> Self {
        self.spec.deletion_aware = true;
        self
    }

    /// Fails the wait after `limit` consecutive transient probe errors.
    pub fn max_transient_probe_errors(mut self, limit: u32) -> Self {
        self.spec.max_transient_probe_errors = Some(limit);
        self
    }

    /// Tolerates up to `count` consecutive not-found observations before
    /// a non-deletion wait fails.
    pub fn not_found_tolerance(mut self, count: u32) -> Self {
        self.spec.not_found_tolerance = count;
        self
    }

    /// Validates and returns the spec.
    pub fn build(self) -> ConvergeResult<WaitSpec> {
        let spec = self.spec;

        if spec.timeout.is_zero() {
            return Err(ConvergeError::invalid_wait_spec("timeout must be positive"));
        }

        let overlap: StatusSet = spec.pending.intersection(&spec.target).cloned().collect();
        if !overlap.is_empty() {
            return Err(ConvergeError::invalid_wait_spec(format!(
                "statuses {} are both pending and target",
                display_set(&overlap)
            )));
        }

        if spec.target.is_empty() && !spec.deletion_aware {
            return Err(ConvergeError::invalid_wait_spec(
                "target statuses are required unless the wait is deletion-aware",
            ));
        }

        if spec.poll_interval.is_zero() && spec.min_poll_interval.is_zero() {
            return Err(ConvergeError::invalid_wait_spec(
                "poll interval and minimum poll interval cannot both be zero",
            ));
        }

        if let PollPolicy::Exponential { max_interval } = spec.policy {
            if max_interval < spec.poll_interval {
                return Err(ConvergeError::invalid_wait_spec(
                    "exponential max_interval is below poll_interval",
                ));
            }
        }

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_builder_defaults() {
        let spec = WaitSpec::builder(secs(60))
            .pending(["CREATING"])
            .target(["ACTIVE"])
            .build()
            .unwrap();

        assert_eq!(spec.timeout(), secs(60));
        assert_eq!(spec.initial_delay(), Duration::ZERO);
        assert_eq!(spec.policy(), PollPolicy::Fixed);
        assert!(spec.is_pending(&Status::from("CREATING")));
        assert!(spec.is_target(&Status::from("ACTIVE")));
        assert!(!spec.is_deletion_aware());
        assert_eq!(spec.max_transient_probe_errors(), None);
    }

    #[test]
    fn test_overlapping_sets_rejected() {
        let err = WaitSpec::builder(secs(60))
            .pending(["UPDATING", "VALID"])
            .target(["VALID"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvergeError::InvalidWaitSpec { .. }));
        assert!(err.to_string().contains("VALID"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = WaitSpec::builder(Duration::ZERO)
            .target(["VALID"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvergeError::InvalidWaitSpec { .. }));
    }

    #[test]
    fn test_empty_target_needs_deletion_awareness() {
        assert!(WaitSpec::builder(secs(1)).pending(["DELETING"]).build().is_err());

        let spec = WaitSpec::builder(secs(1))
            .pending(["DELETING"])
            .deletion_aware()
            .build()
            .unwrap();
        assert_eq!(spec.absent_status(), Status::deleted());
        assert_eq!(spec.expected(), "absence");
    }

    #[test]
    fn test_fixed_interval_clamped_to_minimum() {
        let spec = WaitSpec::builder(secs(60))
            .target(["VALID"])
            .poll_interval(Duration::from_millis(10))
            .min_poll_interval(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(spec.interval_after(1), Duration::from_millis(250));
        assert_eq!(spec.interval_after(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_interval() {
        let spec = WaitSpec::builder(secs(600))
            .target(["VALID"])
            .poll_interval(secs(1))
            .policy(PollPolicy::Exponential {
                max_interval: secs(5),
            })
            .build()
            .unwrap();
        assert_eq!(spec.interval_after(1), secs(1));
        assert_eq!(spec.interval_after(2), secs(2));
        assert_eq!(spec.interval_after(3), secs(4));
        assert_eq!(spec.interval_after(4), secs(5));
        assert_eq!(spec.interval_after(40), secs(5));
    }

    #[test]
    fn test_with_timeout() {
        let spec = WaitSpec::builder(secs(600))
            .target(["VALID"])
            .build()
            .unwrap();
        assert_eq!(spec.with_timeout(secs(5)).unwrap().timeout(), secs(5));
        assert!(spec.with_timeout(Duration::ZERO).is_err());
        assert_eq!(
            spec.with_transient_probe_limit(Some(3))
                .max_transient_probe_errors(),
            Some(3)
        );
    }
}
