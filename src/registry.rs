use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::runtime::SchedulerHandle;
use crate::types::JobId;

/// Constructs a fresh `Job` instance for a given record id and persisted
/// metadata. Used both by `Scheduler::submit_by_type` and by post-crash
/// re-attachment, where the Scheduler re-reads a `running` Job Record and
/// needs to rebuild the live Job that was driving it.
pub type JobFactory =
    Arc<dyn Fn(SchedulerHandle, JobId, serde_json::Value) -> Arc<dyn Job> + Send + Sync>;

/// Name-to-factory mapping. This is the long-lived-state-machine analogue
/// of a type-erased handler registry: rather than mapping a type name to a
/// one-shot executor, it maps to a constructor, because Job Kinds here are
/// stateful objects that live for the lifetime of the job.
#[derive(Default)]
pub struct JobRegistry {
    factories: RwLock<HashMap<String, JobFactory>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_type: impl Into<String>, factory: JobFactory) {
        self.factories.write().insert(job_type.into(), factory);
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.factories.read().contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    pub fn create(
        &self,
        job_type: &str,
        handle: SchedulerHandle,
        job_id: JobId,
        metadata: serde_json::Value,
    ) -> QueueResult<Arc<dyn Job>> {
        let factory = self
            .factories
            .read()
            .get(job_type)
            .cloned()
            .ok_or_else(|| QueueError::FactoryNotRegistered(job_type.to_string()))?;
        Ok(factory(handle, job_id, metadata))
    }
}
