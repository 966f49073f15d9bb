use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
  Scheduled,
  Pending,
  Running,
  Retrying,
  Success,
  Failed,
  Cancelled,
}

impl TaskStatus {
  pub const ALL: [TaskStatus; 7] = [
    TaskStatus::Scheduled,
    TaskStatus::Pending,
    TaskStatus::Running,
    TaskStatus::Retrying,
    TaskStatus::Success,
    TaskStatus::Failed,
    TaskStatus::Cancelled,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Scheduled => "SCHEDULED",
      TaskStatus::Pending => "PENDING",
      TaskStatus::Running => "RUNNING",
      TaskStatus::Retrying => "RETRYING",
      TaskStatus::Success => "SUCCESS",
      TaskStatus::Failed => "FAILED",
      TaskStatus::Cancelled => "CANCELLED",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
  type Err = UnknownStatus;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    TaskStatus::ALL
      .into_iter()
      .find(|status| status.as_str() == s)
      .ok_or_else(|| UnknownStatus(s.to_string()))
  }
}

/// One line of a task's execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
  pub at: DateTime<Utc>,
  pub message: String,
}

impl LogEntry {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      at: Utc::now(),
      message: message.into(),
    }
  }
}

impl fmt::Display for LogEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}] {}", self.at.format("%H:%M:%S"), self.message)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: Uuid,
  pub status: TaskStatus,
  pub task_type: String,
  pub payload: serde_json::Value,
  pub retries: i32,
  pub max_retries: i32,
  pub run_at: DateTime<Utc>,
  pub dispatch_reference: Option<String>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub logs: Vec<LogEntry>,
  pub result: Option<String>,
  pub error_message: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub owner_id: Option<String>,
}

/// A submission as accepted from the owner, before it is persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
  pub task_type: String,
  pub payload: serde_json::Value,
  pub run_at: DateTime<Utc>,
  pub max_retries: Option<i32>,
}

impl Task {
  pub fn scheduled(new_task: NewTask, owner_id: Option<String>, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      status: TaskStatus::Scheduled,
      task_type: new_task.task_type,
      payload: new_task.payload,
      retries: 0,
      max_retries: new_task.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
      run_at: new_task.run_at,
      dispatch_reference: None,
      started_at: None,
      completed_at: None,
      logs: Vec::new(),
      result: None,
      error_message: None,
      created_at: now,
      updated_at: now,
      owner_id,
    }
  }

  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.status == TaskStatus::Scheduled && self.run_at <= now
  }

  /// Human-facing attempt counter, e.g. `2/4` for the first retry of a task allowing three.
  pub fn attempt_label(&self) -> String {
    format!("{}/{}", self.retries + 1, self.max_retries + 1)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedTask {
  #[serde(flatten)]
  pub task: Task,
  pub archived_at: DateTime<Utc>,
}
