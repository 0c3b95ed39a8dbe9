//! In-process batch API for job queues.
//!
//! Behaves like the remote service as far as the reconciler can tell:
//! mutations are accepted immediately and the queue settles over the
//! following describe calls. Each describe reports the current status and
//! then advances the queue one step. Shared safely between concurrent
//! reconciliations.

use std::collections::{HashSet, VecDeque};

use anyhow::bail;
use async_trait::async_trait;
use converge_common::{
    attrs, ApiError, AttrValue, Attributes, AttributesExt, MutationAck, MutationOp,
    MutationRequest, ObservedState, ResourceClient, ResourceKey,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::job_queue::{validate_name, JobQueueSpec};
use crate::tables::{codes, fields, state, status, MAX_COMPUTE_ENVIRONMENTS};

/// Describe calls that report an in-progress status before a queue settles.
pub const DEFAULT_SETTLE_PROBES: u32 = 2;

fn client_error(message: impl Into<String>) -> anyhow::Error {
    ApiError::new(codes::CLIENT_EXCEPTION, message).into()
}

#[derive(Debug, Clone)]
struct Queue {
    name: String,
    arn: String,
    priority: i64,
    state: String,
    compute_environments: Vec<String>,
    scheduling_policy_arn: Option<String>,
    status: &'static str,
    upcoming: VecDeque<&'static str>,
}

impl Queue {
    fn attributes(&self) -> Attributes {
        attrs! {
            fields::NAME => self.name.as_str(),
            fields::ARN => self.arn.as_str(),
            fields::PRIORITY => self.priority,
            fields::STATE => self.state.as_str(),
            fields::COMPUTE_ENVIRONMENTS => self.compute_environments.clone(),
            fields::SCHEDULING_POLICY_ARN => self.scheduling_policy_arn.clone(),
        }
    }

    fn begin(&mut self, transitional: &'static str, settled: &'static str, probes: u32) {
        self.status = transitional;
        self.upcoming = std::iter::repeat(transitional)
            .take(probes.saturating_sub(1) as usize)
            .chain(std::iter::once(settled))
            .collect();
        if probes == 0 {
            self.status = settled;
            self.upcoming.clear();
        }
    }

    fn apply(&mut self, attrs: &Attributes) -> anyhow::Result<()> {
        if let Some(priority) = attrs.get(fields::PRIORITY) {
            self.priority = priority
                .as_int()
                .ok_or_else(|| client_error("priority must be an integer"))?;
        }
        if let Some(value) = attrs.get_str(fields::STATE) {
            if value != state::ENABLED && value != state::DISABLED {
                return Err(client_error(format!("invalid state '{value}'")));
            }
            self.state = value.to_string();
        }
        if attrs.contains_key(fields::COMPUTE_ENVIRONMENTS) {
            self.compute_environments = compute_environments(attrs)?;
        }
        match attrs.get(fields::SCHEDULING_POLICY_ARN) {
            Some(AttrValue::String(arn)) => self.scheduling_policy_arn = Some(arn.clone()),
            Some(AttrValue::Null) if self.scheduling_policy_arn.is_some() => {
                return Err(client_error("cannot remove the scheduling policy of a job queue"));
            }
            _ => {}
        }
        Ok(())
    }
}

fn compute_environments(attrs: &Attributes) -> anyhow::Result<Vec<String>> {
    let envs: Vec<String> = attrs
        .get_str_list(fields::COMPUTE_ENVIRONMENTS)
        .unwrap_or_default()
        .into_iter()
        .map(str::to_string)
        .collect();
    if envs.is_empty() || envs.len() > MAX_COMPUTE_ENVIRONMENTS {
        return Err(client_error(format!(
            "between 1 and {MAX_COMPUTE_ENVIRONMENTS} compute environments are required"
        )));
    }
    Ok(envs)
}

#[derive(Debug, Default)]
struct State {
    queues: Vec<Queue>,
    throttle: u32,
    fail_next: HashSet<String>,
    describe_calls: u64,
    mutate_calls: u64,
}

impl State {
    fn take_throttle(&mut self) -> anyhow::Result<()> {
        if self.throttle > 0 {
            self.throttle -= 1;
            return Err(ApiError::new(codes::THROTTLING, "Rate exceeded").into());
        }
        Ok(())
    }

    /// Index of the queue named (or with ARN) `id`.
    fn find(&self, id: &str) -> anyhow::Result<Option<usize>> {
        let matches: Vec<usize> = self
            .queues
            .iter()
            .enumerate()
            .filter(|(_, q)| q.name == id || q.arn == id)
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [index] => Ok(Some(*index)),
            _ => bail!("Multiple job queues with name {id}"),
        }
    }

    fn existing(&self, id: &str) -> anyhow::Result<usize> {
        self.find(id)?
            .ok_or_else(|| client_error(format!("JobQueue {id} does not exist")))
    }

    fn settled(&mut self, name: &str, target: &'static str) -> &'static str {
        if self.fail_next.remove(name) {
            status::INVALID
        } else {
            target
        }
    }
}

/// Simulated batch service holding job queues in memory.
#[derive(Debug)]
pub struct SimulatedBatch {
    inner: Mutex<State>,
    settle_probes: u32,
    arn_prefix: String,
}

impl Default for SimulatedBatch {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_PROBES)
    }
}

impl SimulatedBatch {
    /// Creates an empty service whose queues settle after `settle_probes`
    /// describe calls.
    pub fn new(settle_probes: u32) -> Self {
        Self {
            inner: Mutex::new(State::default()),
            settle_probes,
            arn_prefix: "arn:sim:batch:local:000000000000:job-queue".to_string(),
        }
    }

    /// ARN assigned to the queue `name`.
    pub fn arn_for(&self, name: &str) -> String {
        format!("{}/{name}", self.arn_prefix)
    }

    /// Inserts an already settled queue.
    pub async fn seed(&self, spec: &JobQueueSpec) {
        let queue = Queue {
            name: spec.name.clone(),
            arn: self.arn_for(&spec.name),
            priority: spec.priority,
            state: spec.state.as_str().to_string(),
            compute_environments: spec.compute_environments.clone(),
            scheduling_policy_arn: spec.scheduling_policy_arn.clone(),
            status: status::VALID,
            upcoming: VecDeque::new(),
        };
        self.inner.lock().await.queues.push(queue);
    }

    /// Adds a second queue with the same name as an existing one.
    pub async fn insert_duplicate(&self, name: &str) {
        let mut state = self.inner.lock().await;
        if let Some(queue) = state.queues.iter().find(|q| q.name == name).cloned() {
            state.queues.push(Queue {
                arn: format!("{}-copy", queue.arn),
                ..queue
            });
        }
    }

    /// Fails the next `calls` API calls with a throttling error.
    pub async fn throttle_next(&self, calls: u32) {
        self.inner.lock().await.throttle = calls;
    }

    /// Makes the next transition of queue `name` end in INVALID.
    pub async fn fail_next_transition(&self, name: &str) {
        self.inner.lock().await.fail_next.insert(name.to_string());
    }

    /// Names of the queues currently held, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .await
            .queues
            .iter()
            .map(|q| q.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Describe and mutate calls served so far.
    pub async fn call_counts(&self) -> (u64, u64) {
        let state = self.inner.lock().await;
        (state.describe_calls, state.mutate_calls)
    }

    fn create(&self, state: &mut State, request: &MutationRequest) -> anyhow::Result<MutationAck> {
        let attrs = &request.attrs;
        let name = attrs.get_str(fields::NAME).unwrap_or(&request.key.id).to_string();
        validate_name(&name).map_err(|e| client_error(e.to_string()))?;
        if state.find(&name)?.is_some() {
            return Err(client_error(format!("Object already exists: job queue {name}")));
        }
        let priority = attrs
            .get_int(fields::PRIORITY)
            .ok_or_else(|| client_error("priority is required"))?;

        let mut queue = Queue {
            arn: self.arn_for(&name),
            name: name.clone(),
            priority,
            state: state::ENABLED.to_string(),
            compute_environments: compute_environments(attrs)?,
            scheduling_policy_arn: None,
            status: status::CREATING,
            upcoming: VecDeque::new(),
        };
        queue.apply(attrs)?;
        let settled = state.settled(&name, status::VALID);
        queue.begin(status::CREATING, settled, self.settle_probes);

        info!(queue = %name, arn = %queue.arn, "job queue created");
        let ack = MutationAck::with_id(queue.arn.clone()).status(status::CREATING);
        state.queues.push(queue);
        Ok(ack)
    }

    fn update(&self, state: &mut State, request: &MutationRequest) -> anyhow::Result<MutationAck> {
        let index = state.existing(&request.key.id)?;
        let current = state.queues[index].status;
        if current != status::VALID && current != status::INVALID {
            return Err(client_error(format!(
                "JobQueue {} is {current} and cannot be updated",
                request.key.id
            )));
        }

        let mut queue = state.queues[index].clone();
        queue.apply(&request.attrs)?;
        let settled = state.settled(&queue.name, status::VALID);
        queue.begin(status::UPDATING, settled, self.settle_probes);

        debug!(queue = %queue.name, op = %request.op, "job queue updating");
        let ack = MutationAck::with_id(queue.arn.clone()).status(status::UPDATING);
        state.queues[index] = queue;
        Ok(ack)
    }

    fn delete(&self, state: &mut State, key: &ResourceKey) -> anyhow::Result<MutationAck> {
        let index = state.existing(&key.id)?;
        let queue = &state.queues[index];
        if queue.state != state::DISABLED {
            return Err(client_error(format!(
                "JobQueue {} must be DISABLED before it can be deleted",
                queue.name
            )));
        }
        if queue.status != status::VALID && queue.status != status::INVALID {
            return Err(client_error(format!(
                "JobQueue {} is {} and cannot be deleted",
                queue.name, queue.status
            )));
        }

        let name = queue.name.clone();
        let settled = state.settled(&name, status::DELETED);
        let queue = &mut state.queues[index];
        queue.begin(status::DELETING, settled, self.settle_probes);

        info!(queue = %name, "job queue deleting");
        Ok(MutationAck::with_id(queue.arn.clone()).status(status::DELETING))
    }
}

#[async_trait]
impl ResourceClient for SimulatedBatch {
    async fn describe(&self, key: &ResourceKey) -> anyhow::Result<Option<ObservedState>> {
        let mut state = self.inner.lock().await;
        state.describe_calls += 1;
        state.take_throttle()?;

        let Some(index) = state.find(&key.id)? else {
            return Ok(None);
        };
        let queue = &mut state.queues[index];
        let observed = ObservedState::present(key.clone(), queue.status, queue.attributes());
        if let Some(next) = queue.upcoming.pop_front() {
            queue.status = next;
        }
        if queue.status == status::DELETED {
            debug!(queue = %queue.name, "job queue deleted");
            state.queues.remove(index);
        }
        Ok(Some(observed))
    }

    async fn mutate(&self, request: &MutationRequest) -> anyhow::Result<MutationAck> {
        let mut state = self.inner.lock().await;
        state.mutate_calls += 1;
        state.take_throttle()?;

        match &request.op {
            MutationOp::Create => self.create(&mut state, request),
            MutationOp::Update { .. } | MutationOp::Disable => self.update(&mut state, request),
            MutationOp::Delete => self.delete(&mut state, &request.key),
        }
    }
}
