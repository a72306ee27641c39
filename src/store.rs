use std::sync::Arc;

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::instrument;

use crate::docstore::{WriteOp, WriteSink};
use crate::error::{QueueError, QueueResult};
use crate::types::{Ctx, JobId, JobRecord, JobRecordStatus};

const COLLECTION: &str = "jobs";

/// Optional filter for `JobRecordStore::list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobRecordStatus>,
    pub kind: Option<String>,
}

/// Thin persistence layer on top of an injected `WriteSink`. Keeps an
/// in-memory index alongside the sink so reads never have to round-trip
/// through the document database — the sink is the durability boundary,
/// not the read path.
pub struct JobRecordStore {
    sink: Arc<dyn WriteSink>,
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl JobRecordStore {
    pub fn new(sink: Arc<dyn WriteSink>) -> Self {
        Self {
            sink,
            records: RwLock::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, metadata))]
    pub async fn create(&self, kind: &str, metadata: serde_json::Value) -> QueueResult<JobId> {
        let id = JobId::new();
        let record = JobRecord::new(id.clone(), kind.to_string(), metadata);
        self.records.write().insert(id.clone(), record.clone());
        self.sink
            .send(WriteOp::upsert(COLLECTION, id.as_str(), record_to_json(&record)))
            .await;
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        ctx: &Ctx,
        id: &JobId,
        status: JobRecordStatus,
        err: Option<String>,
    ) -> QueueResult<()> {
        let record = {
            let mut records = self.records.write();
            let record = records
                .get_mut(id)
                .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
            match status {
                JobRecordStatus::Running => record.mark_running(),
                JobRecordStatus::Succeeded => record.mark_succeeded(),
                JobRecordStatus::Failed => record.mark_failed(err.unwrap_or_default()),
                JobRecordStatus::Cancelled => record.mark_cancelled(),
                JobRecordStatus::Queued => record.status = JobRecordStatus::Queued,
            }
            record.clone()
        };
        // Status transitions gate further scheduling, so this write must be
        // durable before the caller proceeds.
        self.sink
            .send_sync(ctx, WriteOp::upsert(COLLECTION, id.as_str(), record_to_json(&record)))
            .await
    }

    #[instrument(skip(self, patch))]
    pub async fn update_metadata(&self, id: &JobId, patch: serde_json::Value) -> QueueResult<()> {
        let record = {
            let mut records = self.records.write();
            let record = records
                .get_mut(id)
                .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
            merge_metadata(&mut record.metadata, &patch);
            record.clone()
        };
        self.sink
            .send(WriteOp::upsert(COLLECTION, id.as_str(), record_to_json(&record)))
            .await;
        Ok(())
    }

    /// Exposes the underlying sink so callers that already hold a durable
    /// job id (e.g. `SchedulerHandle`) can issue ad hoc writes without
    /// going through the record index.
    pub fn sink(&self) -> &Arc<dyn WriteSink> {
        &self.sink
    }

    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<JobRecord> {
        self.records
            .read()
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.kind.as_ref().map_or(true, |k| &r.kind == k))
            .cloned()
            .collect()
    }

    pub async fn delete(&self, ctx: &Ctx, id: &JobId) -> QueueResult<()> {
        self.records.write().remove(id);
        self.sink.send_sync(ctx, WriteOp::delete(COLLECTION, id.as_str())).await
    }
}

fn record_to_json(record: &JobRecord) -> serde_json::Value {
    serde_json::to_value(record).unwrap_or(serde_json::Value::Null)
}

fn merge_metadata(target: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (serde_json::Value::Object(ref mut target_map), serde_json::Value::Object(patch_map)) =
        (target, patch)
    {
        for (k, v) in patch_map {
            target_map.insert(k.clone(), v.clone());
        }
    }
}
