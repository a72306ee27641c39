use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::capability::{CPUExecutor, ChatProvider, OCRProvider, TTSProvider};
use crate::docstore::WriteSink;
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::registry::{JobFactory, JobRegistry};
use crate::runtime::{spawn_dispatcher, JobRuntime, RuntimeSnapshot, SchedulerHandle};
use crate::store::{JobFilter, JobRecordStore};
use crate::types::{Ctx, JobId, JobRecord};
use crate::unit::{UnitKind, WorkResult, WorkerSnapshot};
use crate::worker::{CapabilityClient, Worker, WorkerConfig, WorkerRouter};

/// Process-wide configuration: the core's only environment/configuration
/// contract.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_worker: WorkerConfig,
    pub default_max_retries: u32,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_worker: WorkerConfig::default(),
            default_max_retries: 3,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

struct ActiveJob {
    runtime: Arc<JobRuntime>,
    dispatcher: tokio::task::JoinHandle<()>,
    dispatcher_ctx: Ctx,
}

/// Process-wide singleton owning the worker pool, the set of active Job
/// Runtimes, and the job-by-book index. This is the crate's only stateful
/// entry point; everything else (capability providers, the document
/// store) is handed in as a trait object.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<JobRecordStore>,
    router: Arc<WorkerRouter>,
    registry: Arc<JobRegistry>,
    active: Arc<DashMap<JobId, ActiveJob>>,
    completion_routes: Arc<DashMap<JobId, mpsc::Sender<WorkResult>>>,
    duplicate_index: Arc<DashMap<(String, String), JobId>>,
    book_index: Arc<DashMap<String, JobId>>,
    global_completion_tx: mpsc::Sender<WorkResult>,
    terminal_tx: mpsc::Sender<JobId>,
    shutting_down: std::sync::atomic::AtomicBool,
    /// Root context every Worker's own `Ctx` is derived from. Cancelling it
    /// in `shutdown()` tears down every Worker run loop, independent of any
    /// one job's `dispatcher_ctx`.
    worker_root_ctx: Ctx,
}

impl Scheduler {
    pub fn new(sink: Arc<dyn WriteSink>, config: SchedulerConfig) -> Arc<Self> {
        let store = Arc::new(JobRecordStore::new(sink));
        let router = Arc::new(WorkerRouter::new());
        let registry = Arc::new(JobRegistry::new());
        let active: Arc<DashMap<JobId, ActiveJob>> = Arc::new(DashMap::new());
        let completion_routes: Arc<DashMap<JobId, mpsc::Sender<WorkResult>>> = Arc::new(DashMap::new());

        let (global_tx, mut global_rx) = mpsc::channel::<WorkResult>(4096);
        let (terminal_tx, mut terminal_rx) = mpsc::channel::<JobId>(256);

        let routes_for_forwarder = completion_routes.clone();
        tokio::spawn(async move {
            while let Some(result) = global_rx.recv().await {
                let route = routes_for_forwarder.get(&result.job_id).map(|r| r.clone());
                match route {
                    Some(tx) => {
                        if tx.send(result).await.is_err() {
                            warn!("job completion channel closed before result delivery");
                        }
                    }
                    None => warn!(job_id = %result.job_id, "dropping result for unknown/terminal job"),
                }
            }
        });

        let active_for_reaper = active.clone();
        let duplicate_for_reaper: Arc<DashMap<(String, String), JobId>> = Arc::new(DashMap::new());
        let duplicate_reaper_ref = duplicate_for_reaper.clone();
        let routes_for_reaper = completion_routes.clone();
        tokio::spawn(async move {
            while let Some(job_id) = terminal_rx.recv().await {
                if let Some((_, active_job)) = active_for_reaper.remove(&job_id) {
                    active_job.dispatcher_ctx.cancel();
                    active_job.dispatcher.abort();
                }
                routes_for_reaper.remove(&job_id);
                duplicate_reaper_ref.retain(|_, v| v != &job_id);
            }
        });

        Arc::new(Self {
            config,
            store,
            router,
            registry,
            active,
            completion_routes,
            duplicate_index: duplicate_for_reaper,
            book_index: Arc::new(DashMap::new()),
            global_completion_tx: global_tx,
            terminal_tx,
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            worker_root_ctx: Ctx::new(),
        })
    }

    pub fn register_factory(&self, job_type: impl Into<String>, factory: JobFactory) {
        self.registry.register(job_type, factory);
    }

    pub fn register_chat_worker(&self, provider: impl Into<String>, client: Arc<dyn ChatProvider>, config: WorkerConfig) {
        let provider = provider.into();
        let handle = Worker::spawn(
            provider.clone(),
            CapabilityClient::Chat(client),
            config,
            self.global_completion_tx.clone(),
            self.worker_root_ctx.child(),
        );
        self.router.insert(UnitKind::Chat, provider, handle);
    }

    pub fn register_ocr_worker(&self, provider: impl Into<String>, client: Arc<dyn OCRProvider>, config: WorkerConfig) {
        let provider = provider.into();
        let handle = Worker::spawn(
            provider.clone(),
            CapabilityClient::Ocr(client),
            config,
            self.global_completion_tx.clone(),
            self.worker_root_ctx.child(),
        );
        self.router.insert(UnitKind::Ocr, provider, handle);
    }

    pub fn register_tts_worker(&self, provider: impl Into<String>, client: Arc<dyn TTSProvider>, config: WorkerConfig) {
        let provider = provider.into();
        let handle = Worker::spawn(
            provider.clone(),
            CapabilityClient::Tts(client),
            config,
            self.global_completion_tx.clone(),
            self.worker_root_ctx.child(),
        );
        self.router.insert(UnitKind::Tts, provider, handle);
    }

    pub fn register_cpu_worker(&self, client: Arc<dyn CPUExecutor>, config: WorkerConfig) {
        let handle = Worker::spawn(
            String::new(),
            CapabilityClient::Cpu(client),
            config,
            self.global_completion_tx.clone(),
            self.worker_root_ctx.child(),
        );
        self.router.insert(UnitKind::Cpu, String::new(), handle);
    }

    /// Create a Job Record, attach a Runtime built by `factory`, and start
    /// it. Returns a duplicate-for-book error if a Runtime of the same
    /// `kind` is already active for `book_id`.
    #[instrument(skip(self, ctx, metadata, factory), fields(kind = %kind, book_id = %book_id))]
    pub async fn submit(
        &self,
        ctx: &Ctx,
        kind: &str,
        book_id: &str,
        metadata: serde_json::Value,
        factory: JobFactory,
    ) -> QueueResult<JobId> {
        if self.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
            return Err(QueueError::ShutdownInProgress);
        }

        let dup_key = (kind.to_string(), book_id.to_string());
        if self.duplicate_index.contains_key(&dup_key) {
            return Err(QueueError::DuplicateForBook(book_id.to_string()));
        }

        let mut metadata = metadata;
        if let serde_json::Value::Object(ref mut map) = metadata {
            map.entry("book_id").or_insert_with(|| book_id.into());
        }

        let job_id = self.store.create(kind, metadata.clone()).await?;
        self.duplicate_index.insert(dup_key, job_id.clone());
        self.book_index.insert(book_id.to_string(), job_id.clone());

        let (job_tx, job_rx) = mpsc::channel::<WorkResult>(256);
        self.completion_routes.insert(job_id.clone(), job_tx.clone());

        let handle = SchedulerHandle::new(
            job_id.clone(),
            self.router.clone(),
            self.store.clone(),
            job_tx,
            self.terminal_tx.clone(),
        );

        let job = factory(handle.clone(), job_id.clone(), metadata);
        job.set_record_id(job_id.clone());

        let runtime = Arc::new(JobRuntime::new(job, handle, self.router.clone()));

        self.store
            .update_status(ctx, &job_id, crate::types::JobRecordStatus::Running, None)
            .await?;

        let dispatcher_ctx = ctx.child();
        let dispatcher = spawn_dispatcher(runtime.clone(), job_rx, dispatcher_ctx.clone());
        self.active.insert(
            job_id.clone(),
            ActiveJob {
                runtime: runtime.clone(),
                dispatcher,
                dispatcher_ctx,
            },
        );

        if let Err(err) = runtime.start(ctx).await {
            warn!(job_id = %job_id, error = %err, "job start failed");
            self.store
                .update_status(ctx, &job_id, crate::types::JobRecordStatus::Failed, Some(err.message().to_string()))
                .await?;
            let _ = self.terminal_tx.send(job_id.clone()).await;
            return Err(QueueError::JobFailed(err));
        }

        info!(job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    #[instrument(skip(self, ctx))]
    pub async fn submit_by_type(&self, ctx: &Ctx, kind_name: &str, book_id: &str) -> QueueResult<JobId> {
        if !self.registry.is_registered(kind_name) {
            return Err(QueueError::FactoryNotRegistered(kind_name.to_string()));
        }
        let registry = self.registry.clone();
        let kind_name_owned = kind_name.to_string();
        let factory: JobFactory = Arc::new(move |handle, job_id, metadata| {
            registry
                .create(&kind_name_owned, handle, job_id, metadata)
                .expect("factory presence checked by caller")
        });
        self.submit(ctx, kind_name, book_id, serde_json::json!({}), factory).await
    }

    pub fn job_status(&self, job_id: &JobId) -> Option<HashMap<String, String>> {
        if let Some(active) = self.active.get(job_id) {
            let job = active.runtime.job();
            let mut status = job.status();
            if let Some(live) = job.as_live_status() {
                for (k, v) in live.live_status() {
                    status.insert(k, v.to_string());
                }
            }
            return Some(status);
        }
        self.store.get(job_id).map(|record| {
            let mut status = HashMap::new();
            status.insert("status".to_string(), record.status.name().to_string());
            status.insert("kind".to_string(), record.kind.clone());
            if let Some(err) = record.error {
                status.insert("error".to_string(), err);
            }
            status
        })
    }

    pub fn job_progress(&self, job_id: &JobId) -> Option<HashMap<String, crate::unit::ProviderProgress>> {
        self.active.get(job_id).map(|active| active.runtime.job().progress())
    }

    pub fn worker_status(&self) -> HashMap<String, WorkerSnapshot> {
        self.router.snapshot_all()
    }

    pub fn get_job_by_book_id(&self, book_id: &str) -> Option<JobRecord> {
        self.book_index
            .get(book_id)
            .and_then(|job_id| self.store.get(&job_id))
    }

    pub fn snapshot(&self, job_id: &JobId) -> Option<RuntimeSnapshot> {
        self.active.get(job_id).map(|active| active.runtime.snapshot())
    }

    /// Re-attach a live Job for a Job Record left `running` by a prior
    /// process (crash recovery). The Kind's own `start` handles resetting
    /// `started=true, complete=false` substate.
    #[instrument(skip(self, ctx))]
    pub async fn reattach(&self, ctx: &Ctx, job_id: &JobId) -> QueueResult<()> {
        let record = self
            .store
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let book_id = record.book_id().unwrap_or_default().to_string();

        let dup_key = (record.kind.clone(), book_id.clone());
        self.duplicate_index.insert(dup_key, job_id.clone());
        self.book_index.insert(book_id, job_id.clone());

        let (job_tx, job_rx) = mpsc::channel::<WorkResult>(256);
        self.completion_routes.insert(job_id.clone(), job_tx.clone());

        let handle = SchedulerHandle::new(
            job_id.clone(),
            self.router.clone(),
            self.store.clone(),
            job_tx,
            self.terminal_tx.clone(),
        );

        let job = self
            .registry
            .create(&record.kind, handle.clone(), job_id.clone(), record.metadata.clone())?;
        job.set_record_id(job_id.clone());

        let runtime = Arc::new(JobRuntime::new(job, handle, self.router.clone()));
        let dispatcher_ctx = ctx.child();
        let dispatcher = spawn_dispatcher(runtime.clone(), job_rx, dispatcher_ctx.clone());
        self.active.insert(
            job_id.clone(),
            ActiveJob {
                runtime: runtime.clone(),
                dispatcher,
                dispatcher_ctx,
            },
        );

        runtime.start(ctx).await.map_err(QueueError::JobFailed)
    }

    /// Stop accepting submissions, cancel all workers, wait for drain, and
    /// persist terminal records for anything still running.
    #[instrument(skip(self, ctx))]
    pub async fn shutdown(self: Arc<Self>, ctx: &Ctx) -> QueueResult<()> {
        self.shutting_down.store(true, std::sync::atomic::Ordering::Release);
        self.worker_root_ctx.cancel();
        for entry in self.active.iter() {
            entry.value().dispatcher_ctx.cancel();
        }
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while !self.active.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for entry in self.active.iter() {
            let job_id = entry.key().clone();
            warn!(job_id = %job_id, "shutdown grace period elapsed with job still running");
        }
        self.router.shutdown_all().await;
        let _ = ctx;
        Ok(())
    }

    pub fn store(&self) -> &Arc<JobRecordStore> {
        &self.store
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.store.list(filter)
    }
}
