use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::JobError;
use crate::tracker::{Tracker, TrackerEntry};
use crate::types::{Ctx, JobId};
use crate::unit::{ProviderProgress, WorkResult, WorkUnit};

/// A state machine a Job Runtime drives. Every exposed method is documented
/// as acquiring the job's own mutex first; concrete kinds that embed
/// `BaseJob` get this for free through its `lock()` accessor.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable identifier used for factory lookup and metrics.
    fn job_type(&self) -> &'static str;

    fn id(&self) -> Option<JobId>;

    fn set_record_id(&self, id: JobId);

    /// Called once by the Scheduler after the job record is persisted.
    /// Must perform crash recovery before emitting units: examine
    /// persisted substate and resurrect an internally consistent in-memory
    /// state. Returning zero units with `is_done() == true` is valid.
    async fn start(&self, ctx: &Ctx) -> Result<Vec<WorkUnit>, JobError>;

    /// Called once per delivered `WorkResult`. Must be idempotent against
    /// unknown unit ids: unrecognized results return no units and no
    /// error so at-least-once delivery never panics a restarted job.
    async fn on_complete(&self, ctx: &Ctx, result: WorkResult) -> Result<Vec<WorkUnit>, JobError>;

    fn status(&self) -> HashMap<String, String>;

    fn progress(&self) -> HashMap<String, ProviderProgress>;

    fn metrics_for(&self, stage: &str) -> crate::unit::MetricsAttribution;

    fn is_done(&self) -> bool;

    /// Optional downcast point for Job Kinds that also implement
    /// `LiveStatusProvider`, i.e. whose in-memory counters are fresher
    /// than their own `status()` projection. The Scheduler probes this
    /// and overlays the result on top of `status()`; Kinds that don't
    /// need it leave the default.
    fn as_live_status(&self) -> Option<&dyn LiveStatusProvider> {
        None
    }
}

/// Optional capability a Job Kind implements when its live in-memory
/// counters are fresher than the store's projection. The Scheduler probes
/// for this via downcast and falls back to the store when absent.
pub trait LiveStatusProvider {
    fn live_status(&self) -> HashMap<String, serde_json::Value>;

    fn as_any(&self) -> &dyn Any;
}

/// Outcome of feeding a `WorkResult` through the uniform retry policy.
pub enum RetryOutcome<E> {
    /// Emit a replacement unit for the same task; `entry` is the
    /// incremented-retry-count tracker entry to register for it.
    Retry(E),
    /// Retries exhausted but the task isn't load-bearing: mark it failed,
    /// count it toward progress, keep going.
    ExhaustedContinue,
    /// Retries exhausted and the task is load-bearing: the whole job must
    /// fail.
    ExhaustedFatal,
}

/// Apply the uniform retry policy shared by every Job Kind: retry up to
/// `max_retries`, then either continue (marking the task failed) or fail
/// the whole job, depending on whether the caller says this task is
/// load-bearing.
pub fn apply_retry_policy<E: TrackerEntry>(
    entry: &E,
    retry_replacement: impl FnOnce(u32) -> E,
    max_retries: u32,
    load_bearing: bool,
) -> RetryOutcome<E> {
    if entry.retry_count() < max_retries {
        RetryOutcome::Retry(retry_replacement(entry.retry_count() + 1))
    } else if load_bearing {
        RetryOutcome::ExhaustedFatal
    } else {
        RetryOutcome::ExhaustedContinue
    }
}

/// Reusable base embedded by concrete Job Kinds. Bundles the mutex, a
/// generic Tracker, the done flag, and per-provider progress rollup, so
/// each Kind only has to write its own `start`/`on_complete` logic.
pub struct BaseJob<S, E: TrackerEntry> {
    record_id: Mutex<Option<JobId>>,
    /// Persisted book-scoped snapshot the Kind interprets; opaque to the
    /// core.
    pub state: Mutex<S>,
    pub tracker: Tracker<E>,
    is_done: AtomicBool,
    progress: Mutex<HashMap<String, ProviderProgress>>,
}

impl<S, E: TrackerEntry> BaseJob<S, E> {
    pub fn new(state: S) -> Self {
        Self {
            record_id: Mutex::new(None),
            state: Mutex::new(state),
            tracker: Tracker::new(),
            is_done: AtomicBool::new(false),
            progress: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Option<JobId> {
        self.record_id.lock().clone()
    }

    pub fn set_record_id(&self, id: JobId) {
        *self.record_id.lock() = Some(id);
    }

    pub fn is_done(&self) -> bool {
        self.is_done.load(Ordering::Acquire)
    }

    /// Once set, `is_done` stays true: every Job Kind's `IsDone` contract is
    /// monotonic.
    pub fn mark_done(&self) {
        self.is_done.store(true, Ordering::Release);
    }

    pub fn register_work_unit(&self, unit: &WorkUnit, entry: E) {
        self.tracker.register(unit.id.clone(), entry);
    }

    pub fn get_work_unit(&self, unit_id: &crate::types::UnitId) -> Option<E> {
        self.tracker.get(unit_id)
    }

    pub fn remove_work_unit(&self, unit_id: &crate::types::UnitId) -> Option<E> {
        self.tracker.remove(unit_id)
    }

    pub fn record_expected(&self, provider: &str, n: u64) {
        self.progress
            .lock()
            .entry(provider.to_string())
            .or_default()
            .record_expected(n);
    }

    pub fn record_completed(&self, provider: &str) {
        self.progress
            .lock()
            .entry(provider.to_string())
            .or_default()
            .record_completed();
    }

    pub fn progress_snapshot(&self) -> HashMap<String, ProviderProgress> {
        self.progress.lock().clone()
    }
}
