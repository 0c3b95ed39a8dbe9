//! JobQueueMgr: reconciles the batch service's job queues to a manifest.

use std::sync::Arc;

use converge_common::{
    ConvergeResult, MutationRequest, Operation, Phase, ReconcilerConfig, Reconciler,
    Reconciliation, Registry, ResourceClient, Severity,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::job_queue::{job_queue_kind, queue_key, JobQueueSpec};
use crate::manifest::Manifest;

/// Builds a reconciler with the job queue kind registered against `client`.
pub fn build_reconciler(
    client: Arc<dyn ResourceClient>,
    config: &ReconcilerConfig,
) -> ConvergeResult<Reconciler> {
    let mut registry = Registry::new();
    registry.register(job_queue_kind(client)?);
    registry.apply_config(config);
    Ok(Reconciler::new(Arc::new(registry), config.retry_policy()))
}

/// Job queue manager.
///
/// Queues are reconciled concurrently and independently: one queue failing
/// or timing out does not stop the others.
#[derive(Debug, Clone)]
pub struct JobQueueMgr {
    daemon_name: String,
    reconciler: Reconciler,
}

impl JobQueueMgr {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            daemon_name: "jobqueuemgrd".to_string(),
            reconciler,
        }
    }

    pub fn daemon_name(&self) -> &str {
        &self.daemon_name
    }

    /// Creates the queue if it does not exist, otherwise updates it.
    #[instrument(skip(self, spec, cancel), fields(queue = %spec.name))]
    pub async fn apply_queue(&self, spec: &JobQueueSpec, cancel: &CancellationToken) -> Reconciliation {
        let key = spec.key();
        match self.reconciler.read(&key, cancel).await {
            Ok(None) => {
                let request = MutationRequest::create(key, spec.to_attributes());
                self.reconciler.create(request, cancel).await
            }
            Ok(Some(observed)) => {
                self.reconciler
                    .update(&key, &spec.to_attributes(), &observed, cancel)
                    .await
            }
            Err(e) => {
                warn!("Cannot read job queue {}: {}", spec.name, e);
                Reconciliation::rejected(key, Operation::Read, e)
            }
        }
    }

    /// Disables and deletes the queue.
    #[instrument(skip(self, cancel))]
    pub async fn destroy_queue(&self, name: &str, cancel: &CancellationToken) -> Reconciliation {
        self.reconciler.delete(&queue_key(name), cancel).await
    }

    /// Applies every queue in `manifest`.
    pub async fn apply(&self, manifest: &Manifest, cancel: &CancellationToken) -> ApplySummary {
        info!("{}: applying {} job queues", self.daemon_name, manifest.len());
        let mut set = JoinSet::new();
        for spec in manifest.job_queues.iter().cloned() {
            let mgr = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move { mgr.apply_queue(&spec, &cancel).await });
        }
        ApplySummary::collect(set).await
    }

    /// Deletes every queue in `manifest`.
    pub async fn destroy(&self, manifest: &Manifest, cancel: &CancellationToken) -> ApplySummary {
        info!("{}: destroying {} job queues", self.daemon_name, manifest.len());
        let mut set = JoinSet::new();
        for name in manifest.job_queues.iter().map(|q| q.name.clone()) {
            let mgr = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move { mgr.destroy_queue(&name, &cancel).await });
        }
        ApplySummary::collect(set).await
    }
}

/// Results of one apply or destroy pass.
#[derive(Debug, Default)]
pub struct ApplySummary {
    /// One result per queue, ordered by key.
    pub results: Vec<Reconciliation>,
    /// Tasks that panicked or were aborted.
    pub aborted: usize,
}

impl ApplySummary {
    async fn collect(mut set: JoinSet<Reconciliation>) -> Self {
        let mut summary = Self::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => summary.results.push(result),
                Err(e) => {
                    error!("Reconciliation task aborted: {}", e);
                    summary.aborted += 1;
                }
            }
        }
        summary.results.sort_by(|a, b| a.key.cmp(&b.key));
        summary
    }

    fn count(&self, phase: Phase) -> usize {
        self.results.iter().filter(|r| r.phase() == phase).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(Phase::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(Phase::Failed)
    }

    pub fn timed_out(&self) -> usize {
        self.count(Phase::TimedOut)
    }

    pub fn cancelled(&self) -> usize {
        self.count(Phase::Cancelled)
    }

    /// True when every queue converged.
    pub fn is_success(&self) -> bool {
        self.aborted == 0 && self.results.iter().all(Reconciliation::is_success)
    }

    /// Logs each diagnostic and a one-line total.
    pub fn log(&self) {
        for result in &self.results {
            for diagnostic in &result.diagnostics {
                match diagnostic.severity {
                    Severity::Info => info!("{}: {}", diagnostic.summary, diagnostic.detail),
                    Severity::Warning => warn!("{}: {}", diagnostic.summary, diagnostic.detail),
                    Severity::Error => error!("{}: {}", diagnostic.summary, diagnostic.detail),
                }
            }
        }
        info!(
            succeeded = self.succeeded(),
            failed = self.failed(),
            timed_out = self.timed_out(),
            cancelled = self.cancelled(),
            aborted = self.aborted,
            "reconciliation pass complete"
        );
    }
}
