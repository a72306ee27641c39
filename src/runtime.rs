use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::docstore::{WriteOp, WriteSink};
use crate::error::{JobError, QueueError, QueueResult};
use crate::job::Job;
use crate::store::JobRecordStore;
use crate::types::{Ctx, JobId, JobRecordStatus};
use crate::unit::{ProviderProgress, WorkResult, WorkUnit, WorkerSnapshot};
use crate::worker::WorkerRouter;

/// Jittered delay floor/span for a backpressure-retry: the unit's routing is
/// re-attempted after `BACKPRESSURE_RETRY_BASE_MS + rand(0..BACKPRESSURE_RETRY_JITTER_MS)`.
const BACKPRESSURE_RETRY_BASE_MS: u64 = 50;
const BACKPRESSURE_RETRY_JITTER_MS: u64 = 100;

/// Opaque capability handed to a Job Runtime so it can post follow-up
/// units and signal terminal outcomes without holding a direct reference
/// back to the Scheduler. This is what breaks the Scheduler/Runtime/Job
/// reference cycle: the Runtime only ever sees this handle.
#[derive(Clone)]
pub struct SchedulerHandle {
    job_id: JobId,
    router: Arc<WorkerRouter>,
    store: Arc<JobRecordStore>,
    /// Delivers synthetic failures for units that couldn't be routed
    /// straight back into this job's own completion stream, so
    /// `on_complete` still sees them rather than the failure vanishing.
    job_completion_tx: mpsc::Sender<WorkResult>,
    terminal_tx: mpsc::Sender<JobId>,
}

impl SchedulerHandle {
    pub(crate) fn new(
        job_id: JobId,
        router: Arc<WorkerRouter>,
        store: Arc<JobRecordStore>,
        job_completion_tx: mpsc::Sender<WorkResult>,
        terminal_tx: mpsc::Sender<JobId>,
    ) -> Self {
        Self {
            job_id,
            router,
            store,
            job_completion_tx,
            terminal_tx,
        }
    }

    /// Route each unit to its capability worker. A backpressured unit (the
    /// worker's bounded queue is momentarily full) is retried after a short
    /// jittered delay without touching the job's own retry budget — it never
    /// reaches `on_complete`. A unit whose `(kind, provider)` has no
    /// registered worker at all is a fatal unit failure: a synthetic failed
    /// `WorkResult` is delivered back into this job's own completion stream
    /// instead of being silently dropped.
    pub async fn post_units(&self, ctx: &Ctx, units: Vec<WorkUnit>) {
        for unit in units {
            let router = self.router.clone();
            let job_completion_tx = self.job_completion_tx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                Self::route_with_backpressure_retry(&router, &job_completion_tx, &ctx, unit).await;
            });
        }
    }

    async fn route_with_backpressure_retry(
        router: &Arc<WorkerRouter>,
        job_completion_tx: &mpsc::Sender<WorkResult>,
        ctx: &Ctx,
        unit: WorkUnit,
    ) {
        loop {
            if ctx.is_cancelled() {
                let _ = job_completion_tx.send(WorkResult::cancelled(&unit)).await;
                return;
            }
            match router.route(unit.clone()) {
                Ok(()) => return,
                Err(QueueError::Backpressure) => {
                    let jitter = rand::random::<u64>() % BACKPRESSURE_RETRY_JITTER_MS;
                    let delay = Duration::from_millis(BACKPRESSURE_RETRY_BASE_MS + jitter);
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            let _ = job_completion_tx.send(WorkResult::cancelled(&unit)).await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    warn!(unit_id = %unit.id, error = %err, "unit could not be routed");
                    let result = WorkResult::failure(&unit, err.to_string());
                    let _ = job_completion_tx.send(result).await;
                    return;
                }
            }
        }
    }

    pub async fn post_terminal(
        &self,
        ctx: &Ctx,
        status: JobRecordStatus,
        error: Option<String>,
    ) -> QueueResult<()> {
        self.store.update_status(ctx, &self.job_id, status, error).await?;
        let _ = self.terminal_tx.send(self.job_id.clone()).await;
        Ok(())
    }

    pub async fn write_gating(&self, ctx: &Ctx, op: WriteOp) -> QueueResult<()> {
        self.store.sink().send_sync(ctx, op).await
    }

    pub async fn write_async(&self, op: WriteOp) {
        self.store.sink().send(op).await;
    }
}

/// Read-only snapshot of a Job Runtime, returned by `snapshot()`.
pub struct RuntimeSnapshot {
    pub job_id: JobId,
    pub status: HashMap<String, String>,
    pub progress: HashMap<String, ProviderProgress>,
    pub worker_status: HashMap<String, WorkerSnapshot>,
    pub is_done: bool,
}

/// Bundles one live `Job` instance with its record id and its
/// `SchedulerHandle`. Offers only the three externally-observable
/// operations the spec names: `start`, `deliver`, `snapshot`.
pub struct JobRuntime {
    job: Arc<dyn Job>,
    handle: SchedulerHandle,
    router: Arc<WorkerRouter>,
}

impl JobRuntime {
    pub fn new(job: Arc<dyn Job>, handle: SchedulerHandle, router: Arc<WorkerRouter>) -> Self {
        Self { job, handle, router }
    }

    #[instrument(skip(self, ctx))]
    pub async fn start(&self, ctx: &Ctx) -> Result<(), JobError> {
        let units = self.job.start(ctx).await?;
        if units.is_empty() && self.job.is_done() {
            info!(job_id = ?self.job.id(), "job finished synchronously with no units");
            let _ = self
                .handle
                .post_terminal(ctx, JobRecordStatus::Succeeded, None)
                .await;
            return Ok(());
        }
        self.handle.post_units(ctx, units).await;
        Ok(())
    }

    #[instrument(skip(self, ctx, result))]
    pub async fn deliver(&self, ctx: &Ctx, result: WorkResult) {
        let outcome = self.job.on_complete(ctx, result).await;
        match outcome {
            Ok(units) => {
                self.handle.post_units(ctx, units).await;
                if self.job.is_done() {
                    let _ = self
                        .handle
                        .post_terminal(ctx, JobRecordStatus::Succeeded, None)
                        .await;
                }
            }
            Err(err) if err.is_fatal() => {
                error!(error = %err, "job failed fatally");
                let _ = self
                    .handle
                    .post_terminal(ctx, JobRecordStatus::Failed, Some(err.message().to_string()))
                    .await;
            }
            Err(err) => {
                // Non-fatal handler errors are logged; the task itself
                // already went through the retry policy inside the Kind.
                warn!(error = %err, "on_complete reported a non-fatal error");
            }
        }
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            job_id: self.job.id().unwrap_or_else(JobId::new),
            status: self.job.status(),
            progress: self.job.progress(),
            worker_status: self.router.snapshot_all(),
            is_done: self.job.is_done(),
        }
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }
}

/// Spawn the per-Runtime dispatcher task: the single reader of this job's
/// completion channel, guaranteeing serialized `on_complete` calls for one
/// job while other jobs progress independently.
pub fn spawn_dispatcher(
    runtime: Arc<JobRuntime>,
    mut rx: mpsc::Receiver<WorkResult>,
    ctx: Ctx,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                maybe_result = rx.recv() => {
                    match maybe_result {
                        Some(result) => runtime.deliver(&ctx, result).await,
                        None => break,
                    }
                }
            }
        }
    })
}
