use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for every fallible operation this crate exposes.
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure-level errors surfaced by the scheduler, worker pool,
/// and job record store.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job kind '{0}' is already running for this book")]
    DuplicateForBook(String),

    #[error("job type not registered: {0}")]
    FactoryNotRegistered(String),

    #[error("worker queue is full")]
    Backpressure,

    #[error("no worker registered for (kind={kind}, provider={provider})")]
    UnknownProvider { kind: String, provider: String },

    #[error("codec not found: {0}")]
    CodecNotFound(String),

    #[error("job execution failed: {0}")]
    JobFailed(#[from] JobError),

    #[error("job record store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("scheduler is shutting down")]
    ShutdownInProgress,

    #[error("operation canceled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Outcome classification for a single work unit's execution. Determines
/// whether a Job Kind's retry loop resubmits the task or gives up on it.
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// Transient failure — safe to retry up to `MaxRetries`.
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Permanent failure — retrying would not help (bad input, 4xx from a
    /// provider, a parse error that isn't provider flakiness).
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The task is load-bearing for the job's overall outcome; exhausting
    /// retries on it must fail the whole Job Record, not just the task.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) | Self::Fatal(msg) => msg,
        }
    }
}

/// Classification a capability call attaches to its own failures, so a Job
/// Kind's retry logic can tell a flaky provider from a client-fatal request
/// without string-matching the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityErrorClass {
    Retryable,
    ClientFatal,
    ServerFatal,
    Cancelled,
}

impl CapabilityErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable | Self::ServerFatal)
    }
}

/// Structured error returned by a capability call (`ChatProvider::chat`,
/// `OCRProvider::recognize`, ...).
#[derive(Error, Debug, Clone)]
#[error("capability error ({class:?}): {message}")]
pub struct CapabilityError {
    pub class: CapabilityErrorClass,
    pub message: String,
}

impl CapabilityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: CapabilityErrorClass::Retryable,
            message: message.into(),
        }
    }

    pub fn client_fatal(message: impl Into<String>) -> Self {
        Self {
            class: CapabilityErrorClass::ClientFatal,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            class: CapabilityErrorClass::Cancelled,
            message: "cancelled".to_string(),
        }
    }
}

impl From<CapabilityError> for JobError {
    fn from(err: CapabilityError) -> Self {
        match err.class {
            CapabilityErrorClass::Retryable | CapabilityErrorClass::ServerFatal => {
                JobError::Retryable(err.message)
            }
            CapabilityErrorClass::ClientFatal => JobError::Permanent(err.message),
            CapabilityErrorClass::Cancelled => JobError::Permanent("cancelled".to_string()),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
