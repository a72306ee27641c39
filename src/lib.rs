//! Job/work-unit scheduling and orchestration core for a multi-stage book
//! ingestion pipeline.
//!
//! This crate implements only the scheduling core: persisting jobs and
//! their sub-state, decomposing a job into typed work units, dispatching
//! those units to typed, rate-limited workers bound to external providers,
//! looping completion results back into per-job state machines, retries,
//! crash recovery, and at-most-one-in-flight dedup per logical task.
//!
//! Everything a concrete pipeline stage (OCR, blending, metadata, table of
//! contents, polishing, text-to-speech) computes is out of scope — each
//! stage is a [`job::Job`] implementation that this crate drives without
//! knowing what it does. External collaborators (the document database,
//! provider clients) are consumed only through the traits in
//! [`capability`] and [`docstore`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use bookqueue_core::docstore::MemoryDocStore;
//! use bookqueue_core::scheduler::{Scheduler, SchedulerConfig};
//!
//! # async fn example() {
//! let sink = Arc::new(MemoryDocStore::new());
//! let scheduler = Scheduler::new(sink, SchedulerConfig::default());
//! # let _ = scheduler;
//! # }
//! ```

pub mod capability;
pub mod docstore;
pub mod error;
pub mod job;
pub mod rate_limiter;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod tracker;
pub mod types;
pub mod unit;
pub mod worker;

pub use error::{CapabilityError, CapabilityErrorClass, JobError, QueueError, QueueResult};
pub use job::{BaseJob, Job, LiveStatusProvider};
pub use registry::{JobFactory, JobRegistry};
pub use runtime::{JobRuntime, SchedulerHandle};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{JobFilter, JobRecordStore};
pub use tracker::{Tracker, TrackerEntry};
pub use types::{Ctx, JobId, JobRecord, JobRecordStatus, UnitId};
pub use unit::{
    MetricsAttribution, ProviderProgress, UnitKind, UnitPayload, WorkOutcome, WorkResult, WorkUnit,
    WorkerSnapshot,
};
pub use worker::{CapabilityClient, Worker, WorkerConfig, WorkerHandle, WorkerRouter};

pub mod prelude {
    pub use crate::capability::{CPUExecutor, ChatProvider, OCRProvider, TTSProvider};
    pub use crate::docstore::{DocStore, WriteOp, WriteSink};
    pub use crate::error::{CapabilityError, JobError, QueueError, QueueResult};
    pub use crate::job::{BaseJob, Job, LiveStatusProvider};
    pub use crate::scheduler::{Scheduler, SchedulerConfig};
    pub use crate::tracker::TrackerEntry;
    pub use crate::types::{Ctx, JobId, JobRecord, JobRecordStatus};
    pub use crate::unit::{UnitKind, WorkOutcome, WorkResult, WorkUnit};
    pub use async_trait::async_trait;
}
