use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::unit::{ChatMessage, ChatOutcome, OcrOutcome, TtsOutcome};

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<serde_json::Value>,
    pub response_schema: Option<serde_json::Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub image_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub text: String,
    pub voice_id: String,
    pub format: String,
    pub stitching_context: Option<serde_json::Value>,
}

/// LLM chat capability. Implementations live entirely outside this crate;
/// the core only ever holds a `dyn ChatProvider`.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatOutcome, CapabilityError>;
}

/// OCR capability.
#[async_trait]
pub trait OCRProvider: Send + Sync {
    async fn recognize(&self, image_ref: &str) -> Result<OcrOutcome, CapabilityError>;
}

/// Text-to-speech capability.
#[async_trait]
pub trait TTSProvider: Send + Sync {
    async fn speak(&self, req: TtsRequest) -> Result<TtsOutcome, CapabilityError>;
}

/// Local CPU-bound work, run on a shared executor rather than a rate-limited
/// remote provider.
#[async_trait]
pub trait CPUExecutor: Send + Sync {
    async fn run(&self, function: serde_json::Value) -> Result<serde_json::Value, CapabilityError>;
}
