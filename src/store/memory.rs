use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{TaskLogLine, TaskStore, TaskUpdate, UpdateOutcome};
use crate::error::StoreError;
use crate::models::{ArchivedTask, LogEntry, Task, TaskStatus};

/// Process-local store. Each method holds the lock for its whole read-modify-write,
/// which gives the same conditional-update guarantees as the SQL store.
#[derive(Default)]
pub struct MemoryTaskStore {
  tasks: Mutex<HashMap<Uuid, Task>>,
  archived: Mutex<Vec<ArchivedTask>>,
}

impl MemoryTaskStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn archived(&self) -> Vec<ArchivedTask> {
    self.archived.lock().await.clone()
  }
}

fn finished_at(task: &Task) -> DateTime<Utc> {
  task.completed_at.unwrap_or(task.updated_at)
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
  async fn insert(&self, task: &Task) -> Result<(), StoreError> {
    self.tasks.lock().await.insert(task.id, task.clone());
    Ok(())
  }

  async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
    Ok(self.tasks.lock().await.get(&id).cloned())
  }

  async fn update(
    &self,
    id: Uuid,
    update: &TaskUpdate,
    expected: Option<TaskStatus>,
  ) -> Result<UpdateOutcome, StoreError> {
    let mut tasks = self.tasks.lock().await;
    let Some(task) = tasks.get_mut(&id) else {
      return Ok(UpdateOutcome::NotFound);
    };
    if expected.is_some_and(|status| status != task.status) {
      return Ok(UpdateOutcome::Conflict);
    }
    update.apply(task, Utc::now());
    Ok(UpdateOutcome::Applied)
  }

  async fn append_log(&self, id: Uuid, entry: &LogEntry) -> Result<(), StoreError> {
    if let Some(task) = self.tasks.lock().await.get_mut(&id) {
      task.logs.push(entry.clone());
      task.updated_at = Utc::now();
    }
    Ok(())
  }

  async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
    let mut due: Vec<Task> = self.tasks.lock().await.values().filter(|t| t.is_due(before)).cloned().collect();
    due.sort_by_key(|t| t.run_at);
    Ok(due)
  }

  async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Task>, StoreError> {
    let mut owned: Vec<Task> = self
      .tasks
      .lock()
      .await
      .values()
      .filter(|t| t.owner_id.as_deref() == Some(owner_id))
      .cloned()
      .collect();
    owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(owned)
  }

  async fn list_stale(
    &self,
    statuses: &[TaskStatus],
    updated_before: DateTime<Utc>,
  ) -> Result<Vec<Task>, StoreError> {
    let mut stale: Vec<Task> = self
      .tasks
      .lock()
      .await
      .values()
      .filter(|t| statuses.contains(&t.status) && t.updated_at < updated_before)
      .cloned()
      .collect();
    stale.sort_by_key(|t| t.updated_at);
    Ok(stale)
  }

  async fn archive_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
    let mut tasks = self.tasks.lock().await;
    let ids: Vec<Uuid> = tasks
      .values()
      .filter(|t| t.status.is_terminal() && finished_at(t) < before)
      .map(|t| t.id)
      .collect();
    let archived_at = Utc::now();
    let mut archived = self.archived.lock().await;
    for id in &ids {
      if let Some(task) = tasks.remove(id) {
        archived.push(ArchivedTask { task, archived_at });
      }
    }
    Ok(ids.len() as u64)
  }

  async fn status_counts(&self) -> Result<Vec<(TaskStatus, i64)>, StoreError> {
    let tasks = self.tasks.lock().await;
    Ok(
      TaskStatus::ALL
        .into_iter()
        .map(|status| (status, tasks.values().filter(|t| t.status == status).count() as i64))
        .filter(|(_, count)| *count > 0)
        .collect(),
    )
  }

  async fn upcoming(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
    let mut scheduled: Vec<Task> = self
      .tasks
      .lock()
      .await
      .values()
      .filter(|t| t.status == TaskStatus::Scheduled)
      .cloned()
      .collect();
    scheduled.sort_by_key(|t| t.run_at);
    scheduled.truncate(limit.max(0) as usize);
    Ok(scheduled)
  }

  async fn recent_logs(&self, limit: i64) -> Result<Vec<TaskLogLine>, StoreError> {
    let mut lines: Vec<TaskLogLine> = self
      .tasks
      .lock()
      .await
      .values()
      .flat_map(|t| t.logs.iter().map(|entry| TaskLogLine { task_id: t.id, entry: entry.clone() }))
      .collect();
    lines.sort_by(|a, b| b.entry.at.cmp(&a.entry.at));
    lines.truncate(limit.max(0) as usize);
    Ok(lines)
  }
}
