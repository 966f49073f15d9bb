use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{TaskLogLine, TaskStore, TaskUpdate, UpdateOutcome};
use crate::error::StoreError;
use crate::models::{LogEntry, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, status, task_type, payload, retries, max_retries, run_at, dispatch_reference, \
  started_at, completed_at, logs, result, error_message, created_at, updated_at, owner_id";

/// PostgreSQL-backed store. Every method runs on a connection checked out of the
/// pool for that statement only.
#[derive(Clone)]
pub struct PgTaskStore {
  pool: PgPool,
}

impl PgTaskStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  async fn fetch_tasks(&self, sql: &str, bind: Binding<'_>) -> Result<Vec<Task>, StoreError> {
    let query = sqlx::query(sql);
    let query = match bind {
      Binding::Time(at) => query.bind(at),
      Binding::Owner(owner) => query.bind(owner),
      Binding::Limit(limit) => query.bind(limit),
    };
    let rows = query.fetch_all(&self.pool).await?;
    rows.iter().map(task_from_row).collect()
  }
}

enum Binding<'a> {
  Time(DateTime<Utc>),
  Owner(&'a str),
  Limit(i64),
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
  let id: Uuid = row.try_get("id")?;
  let status: String = row.try_get("status")?;
  let status = status
    .parse::<TaskStatus>()
    .map_err(|e| StoreError::Corrupt { id, reason: e.to_string() })?;
  let Json(logs): Json<Vec<LogEntry>> = row.try_get("logs")?;
  Ok(Task {
    id,
    status,
    task_type: row.try_get("task_type")?,
    payload: row.try_get("payload")?,
    retries: row.try_get("retries")?,
    max_retries: row.try_get("max_retries")?,
    run_at: row.try_get("run_at")?,
    dispatch_reference: row.try_get("dispatch_reference")?,
    started_at: row.try_get("started_at")?,
    completed_at: row.try_get("completed_at")?,
    logs,
    result: row.try_get("result")?,
    error_message: row.try_get("error_message")?,
    created_at: row.try_get("created_at")?,
    updated_at: row.try_get("updated_at")?,
    owner_id: row.try_get("owner_id")?,
  })
}

#[async_trait]
impl TaskStore for PgTaskStore {
  async fn insert(&self, task: &Task) -> Result<(), StoreError> {
    sqlx::query(
      "INSERT INTO tasks (id, status, task_type, payload, retries, max_retries, run_at, dispatch_reference,
         started_at, completed_at, logs, result, error_message, created_at, updated_at, owner_id)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
    )
    .bind(task.id)
    .bind(task.status.as_str())
    .bind(&task.task_type)
    .bind(&task.payload)
    .bind(task.retries)
    .bind(task.max_retries)
    .bind(task.run_at)
    .bind(&task.dispatch_reference)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(Json(&task.logs))
    .bind(&task.result)
    .bind(&task.error_message)
    .bind(task.created_at)
    .bind(task.updated_at)
    .bind(&task.owner_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(task_from_row).transpose()
  }

  async fn update(
    &self,
    id: Uuid,
    update: &TaskUpdate,
    expected: Option<TaskStatus>,
  ) -> Result<UpdateOutcome, StoreError> {
    let updated = sqlx::query(
      "UPDATE tasks SET
         status = COALESCE($2, status),
         retries = COALESCE($3, retries),
         dispatch_reference = COALESCE($4, dispatch_reference),
         started_at = COALESCE(started_at, $5),
         completed_at = COALESCE($6, completed_at),
         result = COALESCE($7, result),
         error_message = COALESCE($8, error_message),
         logs = logs || $9::jsonb,
         updated_at = NOW()
       WHERE id = $1 AND ($10::text IS NULL OR status = $10)
       RETURNING id",
    )
    .bind(id)
    .bind(update.status.map(|s| s.as_str()))
    .bind(update.retries)
    .bind(&update.dispatch_reference)
    .bind(update.started_at)
    .bind(update.completed_at)
    .bind(&update.result)
    .bind(&update.error_message)
    .bind(Json(&update.append_logs))
    .bind(expected.map(|s| s.as_str()))
    .fetch_optional(&self.pool)
    .await?;

    if updated.is_some() {
      return Ok(UpdateOutcome::Applied);
    }
    let exists: bool = sqlx::query("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
      .bind(id)
      .fetch_one(&self.pool)
      .await?
      .try_get(0)?;
    Ok(if exists { UpdateOutcome::Conflict } else { UpdateOutcome::NotFound })
  }

  async fn append_log(&self, id: Uuid, entry: &LogEntry) -> Result<(), StoreError> {
    sqlx::query("UPDATE tasks SET logs = logs || $2::jsonb, updated_at = NOW() WHERE id = $1")
      .bind(id)
      .bind(Json([entry]))
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn list_due(&self, before: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
    self
      .fetch_tasks(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'SCHEDULED' AND run_at <= $1 ORDER BY run_at"),
        Binding::Time(before),
      )
      .await
  }

  async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Task>, StoreError> {
    self
      .fetch_tasks(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = $1 ORDER BY created_at DESC"),
        Binding::Owner(owner_id),
      )
      .await
  }

  async fn list_stale(
    &self,
    statuses: &[TaskStatus],
    updated_before: DateTime<Utc>,
  ) -> Result<Vec<Task>, StoreError> {
    let statuses: Vec<&str> = statuses.iter().map(TaskStatus::as_str).collect();
    let rows = sqlx::query(&format!(
      "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ANY($1) AND updated_at < $2 ORDER BY updated_at"
    ))
    .bind(&statuses)
    .bind(updated_before)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(task_from_row).collect()
  }

  async fn archive_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
    let moved = sqlx::query(&format!(
      "WITH moved AS (
         DELETE FROM tasks
         WHERE status IN ('SUCCESS', 'FAILED', 'CANCELLED') AND COALESCE(completed_at, updated_at) < $1
         RETURNING {TASK_COLUMNS}
       )
       INSERT INTO archived_tasks ({TASK_COLUMNS}, archived_at)
       SELECT {TASK_COLUMNS}, NOW() FROM moved"
    ))
    .bind(before)
    .execute(&self.pool)
    .await?;
    Ok(moved.rows_affected())
  }

  async fn status_counts(&self) -> Result<Vec<(TaskStatus, i64)>, StoreError> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM tasks GROUP BY status ORDER BY status")
      .fetch_all(&self.pool)
      .await?;
    rows
      .iter()
      .map(|row| -> Result<(TaskStatus, i64), StoreError> {
        let status: String = row.try_get("status")?;
        let status = status.parse::<TaskStatus>().map_err(|e| StoreError::Corrupt {
          id: Uuid::nil(),
          reason: e.to_string(),
        })?;
        Ok((status, row.try_get("total")?))
      })
      .collect()
  }

  async fn upcoming(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
    self
      .fetch_tasks(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'SCHEDULED' ORDER BY run_at LIMIT $1"),
        Binding::Limit(limit),
      )
      .await
  }

  async fn recent_logs(&self, limit: i64) -> Result<Vec<TaskLogLine>, StoreError> {
    let rows = sqlx::query(
      "SELECT t.id, e.entry
       FROM tasks t, jsonb_array_elements(t.logs) AS e(entry)
       ORDER BY (e.entry->>'at')::timestamptz DESC
       LIMIT $1",
    )
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;
    rows
      .iter()
      .map(|row| -> Result<TaskLogLine, StoreError> {
        let Json(entry): Json<LogEntry> = row.try_get("entry")?;
        Ok(TaskLogLine { task_id: row.try_get("id")?, entry })
      })
      .collect()
  }
}
