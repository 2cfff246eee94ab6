use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a processing task in the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A queued unit of work referencing one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub document_id: Uuid,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh pending task, as inserted at upload time.
    pub fn new(document_id: Uuid, priority: i32, max_attempts: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            priority,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the last failure was a rate-limit error.
    pub fn is_quota_backoff(&self) -> bool {
        self.error_message
            .as_deref()
            .is_some_and(|m| m.to_lowercase().contains("quota"))
    }
}
