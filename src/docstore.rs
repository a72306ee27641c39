use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::QueueResult;
use crate::types::Ctx;

/// A single durable write, keyed by `(collection, doc_id)` so the sink can
/// apply it idempotently under at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOp {
    pub collection: String,
    pub doc_id: String,
    pub op: WriteKind,
    pub patch: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Upsert,
    Delete,
}

impl WriteOp {
    pub fn upsert(
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        patch: serde_json::Value,
    ) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            op: WriteKind::Upsert,
            patch,
        }
    }

    pub fn delete(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            op: WriteKind::Delete,
            patch: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocResponse {
    pub data: serde_json::Value,
    pub errors: Vec<String>,
}

/// Synchronous query/mutation surface of the embedding document database.
/// The core never interprets `query`/`vars` beyond passing them through.
#[async_trait]
pub trait DocStore: Send + Sync {
    async fn execute(
        &self,
        ctx: &Ctx,
        query: &str,
        vars: serde_json::Value,
    ) -> QueueResult<DocResponse>;
}

/// Write path into the document database. `send` is fire-and-forget,
/// at-least-once; `send_sync` blocks until the write is durable and must be
/// used for any write that gates dispatch of a dependent work unit.
#[async_trait]
pub trait WriteSink: Send + Sync {
    async fn send(&self, op: WriteOp);

    async fn send_sync(&self, ctx: &Ctx, op: WriteOp) -> QueueResult<()>;
}

/// In-memory `DocStore`/`WriteSink` pair used by the crate's own test
/// suite. Not a real document database: `execute` only understands a single
/// `"get"` query that echoes back the stored document for `vars.doc_id`
/// under `vars.collection`.
#[derive(Default)]
pub struct MemoryDocStore {
    docs: RwLock<HashMap<(String, String), serde_json::Value>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection: &str, doc_id: &str) -> Option<serde_json::Value> {
        self.docs
            .read()
            .get(&(collection.to_string(), doc_id.to_string()))
            .cloned()
    }

    fn apply(&self, op: WriteOp) {
        let key = (op.collection, op.doc_id);
        match op.op {
            WriteKind::Upsert => {
                let mut docs = self.docs.write();
                let entry = docs.entry(key).or_insert(serde_json::Value::Object(Default::default()));
                merge_json(entry, &op.patch);
            }
            WriteKind::Delete => {
                self.docs.write().remove(&key);
            }
        }
    }
}

fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (serde_json::Value::Object(target_map), serde_json::Value::Object(patch_map)) =
        (target.clone(), patch)
    {
        let mut merged = target_map;
        for (k, v) in patch_map {
            merged.insert(k.clone(), v.clone());
        }
        *target = serde_json::Value::Object(merged);
    } else {
        *target = patch.clone();
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn execute(
        &self,
        _ctx: &Ctx,
        query: &str,
        vars: serde_json::Value,
    ) -> QueueResult<DocResponse> {
        if query != "get" {
            return Ok(DocResponse {
                data: serde_json::Value::Null,
                errors: vec![format!("unsupported query: {query}")],
            });
        }
        let collection = vars.get("collection").and_then(|v| v.as_str()).unwrap_or_default();
        let doc_id = vars.get("doc_id").and_then(|v| v.as_str()).unwrap_or_default();
        let data = self.get(collection, doc_id).unwrap_or(serde_json::Value::Null);
        Ok(DocResponse { data, errors: vec![] })
    }
}

#[async_trait]
impl WriteSink for MemoryDocStore {
    async fn send(&self, op: WriteOp) {
        self.apply(op);
    }

    async fn send_sync(&self, _ctx: &Ctx, op: WriteOp) -> QueueResult<()> {
        self.apply(op);
        Ok(())
    }
}
