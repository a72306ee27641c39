use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CapabilityErrorClass;
use crate::types::{JobId, UnitId};

/// What kind of capability a Work Unit is bound for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Cpu,
    Ocr,
    Chat,
    Tts,
}

impl UnitKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Ocr => "ocr",
            Self::Chat => "chat",
            Self::Tts => "tts",
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Capability-specific request payload carried by a Work Unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum UnitPayload {
    Chat {
        messages: Vec<ChatMessage>,
        tools: Vec<serde_json::Value>,
        response_schema: Option<serde_json::Value>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        image_bytes: Option<Vec<u8>>,
    },
    Ocr {
        image_ref: String,
    },
    Tts {
        text: String,
        voice_id: String,
        format: String,
        stitching_context: Option<serde_json::Value>,
    },
    Cpu {
        function: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Cost/latency attribution carried alongside a Work Unit, written out
/// through the `WriteSink` once the unit completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsAttribution {
    pub book_id: String,
    pub stage: String,
    pub item_key: String,
    pub prompt_key: Option<String>,
    pub content_id: Option<String>,
    pub tags: std::collections::HashMap<String, String>,
}

/// An in-flight request dispatched to a Worker. Never persisted — see
/// `JobRecord` for the durable counterpart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: UnitId,
    pub job_id: JobId,
    pub kind: UnitKind,
    /// Empty for CPU units.
    pub provider: String,
    pub payload: UnitPayload,
    pub attribution: MetricsAttribution,
    /// Set by the Tracker on registration/retry, never by the producer.
    pub retry_count: u32,
}

impl WorkUnit {
    pub fn new(
        job_id: JobId,
        kind: UnitKind,
        provider: impl Into<String>,
        payload: UnitPayload,
        attribution: MetricsAttribution,
    ) -> Self {
        Self {
            id: UnitId::new(),
            job_id,
            kind,
            provider: provider.into(),
            payload,
            attribution,
            retry_count: 0,
        }
    }

    /// Build the replacement unit for a retry: same task shape, new id,
    /// incremented retry count.
    pub fn retry(&self) -> Self {
        Self {
            id: UnitId::new(),
            job_id: self.job_id.clone(),
            kind: self.kind,
            provider: self.provider.clone(),
            payload: self.payload.clone(),
            attribution: self.attribution.clone(),
            retry_count: self.retry_count + 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub text: String,
    pub parsed_json: Option<serde_json::Value>,
    pub tool_calls: Vec<serde_json::Value>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutcome {
    pub text: String,
    pub confidence: f32,
    pub raw_payload: Option<serde_json::Value>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsOutcome {
    pub audio_ref: String,
    pub duration_ms: u64,
    pub cost_usd: f64,
}

/// What a capability call produced, carried back inside a `WorkResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WorkOutcome {
    Chat(ChatOutcome),
    Ocr(OcrOutcome),
    Tts(TtsOutcome),
    Cpu(serde_json::Value),
}

/// The result of executing exactly one `WorkUnit`, delivered back to the
/// Scheduler once by the owning Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub work_unit_id: UnitId,
    pub job_id: JobId,
    pub success: bool,
    pub error: Option<String>,
    /// How the underlying capability call classified its own failure, so a
    /// Job Kind's `on_complete` can decline to retry a permanent error
    /// instead of burning through `MaxRetries` on something that can never
    /// succeed. `None` for a success, or for a failure that never reached a
    /// capability call (e.g. routing failures).
    pub error_class: Option<CapabilityErrorClass>,
    pub outcome: Option<WorkOutcome>,
    pub retry_count: u32,
    pub delivered_at: DateTime<Utc>,
}

impl WorkResult {
    pub fn success(unit: &WorkUnit, outcome: WorkOutcome) -> Self {
        Self {
            work_unit_id: unit.id.clone(),
            job_id: unit.job_id.clone(),
            success: true,
            error: None,
            error_class: None,
            outcome: Some(outcome),
            retry_count: unit.retry_count,
            delivered_at: Utc::now(),
        }
    }

    pub fn failure(unit: &WorkUnit, error: impl Into<String>) -> Self {
        Self {
            work_unit_id: unit.id.clone(),
            job_id: unit.job_id.clone(),
            success: false,
            error: Some(error.into()),
            error_class: None,
            outcome: None,
            retry_count: unit.retry_count,
            delivered_at: Utc::now(),
        }
    }

    /// A failure originating from a capability call, carrying its error
    /// classification so the caller can tell a flaky provider from a
    /// permanent, non-retryable one.
    pub fn capability_failure(unit: &WorkUnit, error: impl Into<String>, class: CapabilityErrorClass) -> Self {
        Self {
            error_class: Some(class),
            ..Self::failure(unit, error)
        }
    }

    pub fn cancelled(unit: &WorkUnit) -> Self {
        let mut result = Self::failure(unit, "cancelled");
        result.error_class = Some(CapabilityErrorClass::Cancelled);
        result
    }

    /// Whether a Job Kind should attempt a retry for this result: always
    /// true for a success (nothing to retry), and for a failure, only when
    /// the underlying error is classified as retryable or has no
    /// classification at all (routing failures retain the historical
    /// always-retry behavior).
    pub fn is_retryable(&self) -> bool {
        match self.error_class {
            Some(class) => class.is_retryable(),
            None => true,
        }
    }
}

/// Reporting-only rollup of a single provider's throughput on a job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderProgress {
    pub total_expected: u64,
    pub completed: u64,
}

impl ProviderProgress {
    pub fn record_expected(&mut self, n: u64) {
        self.total_expected += n;
    }

    pub fn record_completed(&mut self) {
        self.completed += 1;
    }
}

/// Reporting-only snapshot of a single Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub queue_depth: usize,
    pub active: usize,
    pub rate_tokens: f64,
    pub last_failure: Option<DateTime<Utc>>,
}
