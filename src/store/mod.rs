use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{LogEntry, Task, TaskStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryTaskStore;
pub use postgres::PgTaskStore;

/// Field changes applied in one atomic write. `None` leaves a column alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
  pub status: Option<TaskStatus>,
  pub retries: Option<i32>,
  pub dispatch_reference: Option<String>,
  /// Written only when the task has no `started_at` yet.
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub result: Option<String>,
  pub error_message: Option<String>,
  pub append_logs: Vec<LogEntry>,
}

impl TaskUpdate {
  pub fn status(status: TaskStatus) -> Self {
    Self { status: Some(status), ..Self::default() }
  }

  pub fn dispatch_reference(reference: impl Into<String>) -> Self {
    Self { dispatch_reference: Some(reference.into()), ..Self::default() }
  }

  pub fn with_retries(mut self, retries: i32) -> Self {
    self.retries = Some(retries);
    self
  }

  pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
    self.started_at = Some(at);
    self
  }

  pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
    self.completed_at = Some(at);
    self
  }

  pub fn with_result(mut self, result: impl Into<String>) -> Self {
    self.result = Some(result.into());
    self
  }

  pub fn with_error(mut self, message: impl Into<String>) -> Self {
    self.error_message = Some(message.into());
    self
  }

  pub fn with_log(mut self, message: impl Into<String>) -> Self {
    self.append_logs.push(LogEntry::new(message));
    self
  }

  pub(crate) fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
    if let Some(status) = self.status {
      task.status = status;
    }
    if let Some(retries) = self.retries {
      task.retries = retries;
    }
    if let Some(reference) = &self.dispatch_reference {
      task.dispatch_reference = Some(reference.clone());
    }
    if task.started_at.is_none() {
      task.started_at = self.started_at;
    }
    if let Some(at) = self.completed_at {
      task.completed_at = Some(at);
    }
    if let Some(result) = &self.result {
      task.result = Some(result.clone());
    }
    if let Some(message) = &self.error_message {
      task.error_message = Some(message.clone());
    }
    task.logs.extend(self.append_logs.iter().cloned());
    task.updated_at = now;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
  Applied,
  /// The task exists but its status no longer matched the expected one.
  Conflict,
  NotFound,
}

/// A log line together with the task it belongs to, for operator views.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLogLine {
  pub task_id: Uuid,
  pub entry: LogEntry,
}

/// Durable task records. Every status change goes through [`TaskStore::update`]
/// with the status the writer observed, so concurrent pollers and workers
/// cannot both win the same transition.
#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn insert(&self, task: &Task) -> Result<(), StoreError>;

  async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

  /// Applies `update` if the task is currently in `expected` (or unconditionally for `None`).
  async fn update(
    &self,
    id: Uuid,
    update: &TaskUpdate,
    expected: Option<TaskStatus>,
  ) -> Result<UpdateOutcome, StoreError>;

  async fn append_log(&self, id: Uuid, entry: &LogEntry) -> Result<(), StoreError>;

  /// SCHEDULED tasks with `run_at <= before`, earliest first.
  async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

  /// Newest first.
  async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Task>, StoreError>;

  async fn list_stale(
    &self,
    statuses: &[TaskStatus],
    updated_before: DateTime<Utc>,
  ) -> Result<Vec<Task>, StoreError>;

  /// Moves terminal tasks last touched before `before` into the archive. Returns how many moved.
  async fn archive_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

  async fn status_counts(&self) -> Result<Vec<(TaskStatus, i64)>, StoreError>;

  /// Next SCHEDULED tasks by `run_at`, due or not.
  async fn upcoming(&self, limit: i64) -> Result<Vec<Task>, StoreError>;

  async fn recent_logs(&self, limit: i64) -> Result<Vec<TaskLogLine>, StoreError>;
}
