//! What an owner can do to their own tasks: submit, look, cancel.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{NewTask, Task, TaskStatus};
use crate::state_machine::{CancelRefusal, cancel_transition, is_cancellable};
use crate::store::{TaskStore, UpdateOutcome};

pub const MAX_RETRIES_LIMIT: i32 = 10;

static TASK_TYPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum OwnerError {
  #[error("{0}")]
  Invalid(String),

  #[error("Task not found")]
  NotFound,

  #[error("Not allowed")]
  Forbidden,

  #[error("Task already {0}, cannot cancel")]
  NotCancellable(TaskStatus),

  #[error("Task changed while cancelling, try again")]
  Conflict,

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl From<CancelRefusal> for OwnerError {
  fn from(refusal: CancelRefusal) -> Self {
    match refusal {
      CancelRefusal::NotOwner => OwnerError::Forbidden,
      CancelRefusal::NotCancellable(status) => OwnerError::NotCancellable(status),
    }
  }
}

/// Accepts RFC 3339 or the `YYYY-MM-DD HH:MM` form, the latter read as UTC.
pub fn parse_run_at(raw: &str) -> Result<DateTime<Utc>, OwnerError> {
  let raw = raw.trim();
  if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
    return Ok(at.with_timezone(&Utc));
  }
  NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
    .map(|naive| naive.and_utc())
    .map_err(|_| OwnerError::Invalid(format!("Invalid run_at '{raw}', expected RFC 3339 or YYYY-MM-DD HH:MM")))
}

pub fn validate(new_task: &NewTask) -> Result<(), OwnerError> {
  if !TASK_TYPE.is_match(&new_task.task_type) {
    return Err(OwnerError::Invalid(format!("Invalid task_type '{}'", new_task.task_type)));
  }
  if let Some(max) = new_task.max_retries {
    if !(0..=MAX_RETRIES_LIMIT).contains(&max) {
      return Err(OwnerError::Invalid(format!("max_retries must be between 0 and {MAX_RETRIES_LIMIT}")));
    }
  }
  Ok(())
}

/// Stores a new SCHEDULED task. It is not dispatched here; the poller picks it
/// up once `run_at` has passed.
pub async fn submit(store: &dyn TaskStore, owner_id: &str, new_task: NewTask) -> Result<Task, OwnerError> {
  validate(&new_task)?;
  let task = Task::scheduled(new_task, Some(owner_id.to_string()), Utc::now());
  store.insert(&task).await?;
  info!(task_id = %task.id, task_type = %task.task_type, run_at = %task.run_at, "Task scheduled");
  Ok(task)
}

pub async fn list(store: &dyn TaskStore, owner_id: &str) -> Result<Vec<Task>, OwnerError> {
  Ok(store.list_by_owner(owner_id).await?)
}

pub async fn fetch(store: &dyn TaskStore, owner_id: &str, task_id: Uuid) -> Result<Task, OwnerError> {
  let task = store.get(task_id).await?.ok_or(OwnerError::NotFound)?;
  if task.owner_id.as_deref() != Some(owner_id) {
    return Err(OwnerError::Forbidden);
  }
  Ok(task)
}

/// Cancels a SCHEDULED or PENDING task. The write is conditional on the status
/// observed here, so a task that a worker claims in the meantime stays claimed.
pub async fn cancel(store: &dyn TaskStore, owner_id: &str, task_id: Uuid) -> Result<Task, OwnerError> {
  let task = store.get(task_id).await?.ok_or(OwnerError::NotFound)?;
  let transition = cancel_transition(&task, owner_id)?;
  let update = transition.update().with_log("Task cancelled by owner");

  match store.update(task_id, &update, transition.expected()).await? {
    UpdateOutcome::Applied => {}
    UpdateOutcome::NotFound => return Err(OwnerError::NotFound),
    UpdateOutcome::Conflict => {
      let current = store.get(task_id).await?.ok_or(OwnerError::NotFound)?;
      warn!(%task_id, status = %current.status, "Cancel lost a race");
      return Err(if is_cancellable(current.status) {
        OwnerError::Conflict
      } else {
        OwnerError::NotCancellable(current.status)
      });
    }
  }

  info!(%task_id, "Task cancelled by owner");
  store.get(task_id).await?.ok_or(OwnerError::NotFound)
}
