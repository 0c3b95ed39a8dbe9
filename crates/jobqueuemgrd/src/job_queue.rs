//! Job queue resource kind: desired-state model, diff, wait profile and
//! registry entry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use converge_common::{
    attrs, AttrValue, Attributes, AttributesExt, ConfigDiff, ConvergeError, ConvergeResult,
    DefaultClassifier, DrainStep, ErrorClass, ErrorClassifier, GroupedDiff, MutationGroup,
    PollPolicy, ResourceClient, ResourceKey, ResourceKind, WaitProfile, WaitSpec,
    DEFAULT_OPERATION_TIMEOUT,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tables::{self, codes, fields, groups, status, JOB_QUEUE_KIND};

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Za-z][0-9A-Za-z_-]{0,127}$").expect("Invalid regex pattern"));

/// Job queue validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobQueueError {
    #[error(
        "Invalid job queue name '{0}': must be up to 128 letters, numbers, underscores and dashes, starting with a letter or number"
    )]
    InvalidName(String),

    #[error("Job queue '{0}' must reference at least one compute environment")]
    NoComputeEnvironments(String),

    #[error("Job queue '{name}' references {count} compute environments (max {max})")]
    TooManyComputeEnvironments {
        name: String,
        count: usize,
        max: usize,
    },
}

/// Enabled/disabled state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueState {
    #[default]
    Enabled,
    Disabled,
}

impl QueueState {
    /// API spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Enabled => tables::state::ENABLED,
            QueueState::Disabled => tables::state::DISABLED,
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired configuration of one job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobQueueSpec {
    pub name: String,
    pub priority: i64,
    #[serde(default)]
    pub state: QueueState,
    pub compute_environments: Vec<String>,
    #[serde(default)]
    pub scheduling_policy_arn: Option<String>,
}

impl JobQueueSpec {
    /// Checks the name pattern and compute environment count.
    pub fn validate(&self) -> Result<(), JobQueueError> {
        validate_name(&self.name)?;
        match self.compute_environments.len() {
            0 => Err(JobQueueError::NoComputeEnvironments(self.name.clone())),
            count if count > tables::MAX_COMPUTE_ENVIRONMENTS => {
                Err(JobQueueError::TooManyComputeEnvironments {
                    name: self.name.clone(),
                    count,
                    max: tables::MAX_COMPUTE_ENVIRONMENTS,
                })
            }
            _ => Ok(()),
        }
    }

    /// Registry key addressing the queue by name.
    pub fn key(&self) -> ResourceKey {
        queue_key(&self.name)
    }

    /// Full desired attribute set, as sent on create.
    pub fn to_attributes(&self) -> Attributes {
        attrs! {
            fields::NAME => self.name.as_str(),
            fields::PRIORITY => self.priority,
            fields::STATE => self.state.as_str(),
            fields::COMPUTE_ENVIRONMENTS => self.compute_environments.clone(),
            fields::SCHEDULING_POLICY_ARN => self.scheduling_policy_arn.clone(),
        }
    }
}

/// Checks a queue name against the service's naming rule.
pub fn validate_name(name: &str) -> Result<(), JobQueueError> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(JobQueueError::InvalidName(name.to_string()))
    }
}

/// Key of the queue named (or with ARN) `id`.
pub fn queue_key(id: &str) -> ResourceKey {
    ResourceKey::new(JOB_QUEUE_KIND, id)
}

/// Diff for job queues.
///
/// Settings go out before the state change. A queue with a scheduling
/// policy must repeat it on every settings update, and the policy can
/// never be removed once set.
pub struct JobQueueDiff {
    groups: GroupedDiff,
}

impl JobQueueDiff {
    pub fn new() -> Self {
        Self {
            groups: GroupedDiff::new()
                .group(
                    groups::SETTINGS,
                    [
                        fields::PRIORITY,
                        fields::COMPUTE_ENVIRONMENTS,
                        fields::SCHEDULING_POLICY_ARN,
                    ],
                )
                .group(groups::STATE, [fields::STATE]),
        }
    }
}

impl Default for JobQueueDiff {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDiff for JobQueueDiff {
    fn diff(&self, desired: &Attributes, observed: &Attributes) -> ConvergeResult<Vec<MutationGroup>> {
        let current_policy = observed.get_str(fields::SCHEDULING_POLICY_ARN);
        if current_policy.is_some() && desired.get_str(fields::SCHEDULING_POLICY_ARN).is_none() {
            let name = observed
                .get_str(fields::NAME)
                .or_else(|| desired.get_str(fields::NAME))
                .unwrap_or("job queue");
            return Err(ConvergeError::invalid_update(
                queue_key(name),
                "cannot remove the fair share scheduling policy",
            ));
        }

        let mut changes = self.groups.diff(desired, observed)?;
        if let Some(policy) = current_policy {
            for group in changes.iter_mut().filter(|g| g.name == groups::SETTINGS) {
                group
                    .attrs
                    .entry(fields::SCHEDULING_POLICY_ARN.to_string())
                    .or_insert_with(|| AttrValue::from(policy));
            }
        }
        Ok(changes)
    }
}

/// Classifier for the batch API.
///
/// The service reports operations on unknown queues as a generic
/// `ClientException`, so not-found is recognized by message as well as
/// by code.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchClassifier;

impl ErrorClassifier for BatchClassifier {
    fn classify(&self, err: &anyhow::Error) -> ErrorClass {
        DefaultClassifier.classify(err)
    }

    fn is_not_found(&self, err: &anyhow::Error) -> bool {
        DefaultClassifier.is_not_found(err)
            || err.chain().any(|cause| {
                cause
                    .downcast_ref::<converge_common::ApiError>()
                    .is_some_and(|api| {
                        api.code == codes::CLIENT_EXCEPTION && api.message.contains("does not exist")
                    })
            })
    }
}

fn spec(
    pending: &[&str],
    target: &[&str],
    initial_delay: Duration,
    min_interval: Duration,
) -> ConvergeResult<WaitSpec> {
    WaitSpec::builder(DEFAULT_OPERATION_TIMEOUT)
        .pending(pending.iter().copied())
        .target(target.iter().copied())
        .initial_delay(initial_delay)
        .poll_interval(min_interval)
        .min_poll_interval(min_interval)
        .policy(PollPolicy::Exponential {
            max_interval: Duration::from_secs(10).max(min_interval),
        })
        .build()
}

/// Wait templates for job queues.
pub fn wait_profile() -> ConvergeResult<WaitProfile> {
    let delay = Duration::from_secs(30);
    let interval = Duration::from_secs(10);
    Ok(WaitProfile {
        create: spec(&[status::CREATING, status::UPDATING], &[status::VALID], delay, interval)?,
        update: spec(&[status::UPDATING], &[status::VALID], delay, interval)?,
        delete: WaitSpec::builder(DEFAULT_OPERATION_TIMEOUT)
            .pending([tables::state::DISABLED, status::DELETING])
            .target([status::DELETED])
            .deletion_aware()
            .initial_delay(delay)
            .poll_interval(interval)
            .min_poll_interval(interval)
            .build()?,
    })
}

/// Disable step run before deletion.
pub fn drain_step() -> ConvergeResult<DrainStep> {
    Ok(DrainStep {
        attrs: attrs! { fields::STATE => tables::state::DISABLED },
        wait: spec(
            &[status::UPDATING],
            &[status::VALID],
            Duration::from_secs(10),
            Duration::from_secs(3),
        )?,
    })
}

/// Registry entry for job queues backed by `client`.
pub fn job_queue_kind(client: Arc<dyn ResourceClient>) -> ConvergeResult<ResourceKind> {
    Ok(ResourceKind::new(
        JOB_QUEUE_KIND,
        client,
        wait_profile()?,
        Arc::new(JobQueueDiff::new()),
    )
    .with_classifier(Arc::new(BatchClassifier))
    .with_drain(drain_step()?))
}
