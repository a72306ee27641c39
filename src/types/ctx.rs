use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Cancellation-and-observability context threaded through every public
/// entry point on the Scheduler, Job Runtime, and Worker. Cancellation
/// aborts the operation at the next suspension point.
#[derive(Debug, Clone)]
pub struct Ctx {
    cancellation: CancellationToken,

    /// Distributed tracing correlation id, propagated into `tracing` spans.
    pub trace_id: Option<String>,

    /// Request id for correlating a Scheduler call back to its caller.
    pub request_id: Option<String>,

    /// Free-form observability tags.
    pub tags: HashMap<String, String>,
}

impl Ctx {
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            trace_id: None,
            request_id: None,
            tags: HashMap::new(),
        }
    }

    /// Derive a child context that is cancelled whenever `self` is, but can
    /// also be cancelled independently (used by the Scheduler to hand each
    /// Worker its own cancellable view of the shutdown signal).
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            trace_id: self.trace_id.clone(),
            request_id: self.request_id.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}
