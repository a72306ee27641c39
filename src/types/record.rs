use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobId;

/// Lifecycle: `queued -> running -> {succeeded, failed, cancelled}`. There
/// is no path back out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRecordStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobRecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal edge in the state DAG.
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobRecordStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Queued, Cancelled)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobRecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Durable record of a submitted job. `metadata` is an opaque mapping that
/// always includes `book_id` plus whatever fields the Job Kind needs; the
/// core never interprets it beyond that key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub status: JobRecordStatus,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: JobId, kind: String, metadata: serde_json::Value) -> Self {
        Self {
            id,
            kind,
            status: JobRecordStatus::Queued,
            metadata,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn book_id(&self) -> Option<&str> {
        self.metadata.get("book_id").and_then(|v| v.as_str())
    }

    /// Move to `running` and stamp `started_at` if this is the first time.
    pub fn mark_running(&mut self) {
        debug_assert!(self.status.can_transition_to(JobRecordStatus::Running));
        self.status = JobRecordStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_succeeded(&mut self) {
        debug_assert!(self.status.can_transition_to(JobRecordStatus::Succeeded));
        self.status = JobRecordStatus::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        debug_assert!(self.status.can_transition_to(JobRecordStatus::Failed));
        self.status = JobRecordStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobRecordStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
