//! Download task state as seen from outside the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Merging,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskPhase {
    None,
    Video,
    Audio,
    Merging,
}

/// Point-in-time copy of a task. Every published event is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub url: String,
    pub format_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub phase: TaskPhase,
    /// `None` while merging: the merge step has no measurable progress
    pub progress_percent: Option<f64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub downloaded_bytes: u64,
    /// 0 when unknown
    pub total_bytes: u64,
    pub file_size: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    pub fn new(id: String, url: String, format_id: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            url,
            format_id,
            title,
            status: TaskStatus::Pending,
            phase: TaskPhase::None,
            progress_percent: Some(0.0),
            speed: None,
            eta: None,
            downloaded_bytes: 0,
            total_bytes: 0,
            file_size: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn mark_completed(&mut self, file_size: u64) {
        self.status = TaskStatus::Completed;
        self.progress_percent = Some(100.0);
        self.speed = None;
        self.eta = None;
        self.file_size = Some(file_size);
        self.downloaded_bytes = file_size;
        self.total_bytes = file_size;
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, cause: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.speed = None;
        self.eta = None;
        self.error = Some(cause.into());
    }
}

/// Completed output of a tracked task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultArtifact {
    pub path: PathBuf,
    /// Name offered to the client, e.g. `"My Video.mp4"`
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}
