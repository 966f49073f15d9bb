//! One worker attempt of one task: claim, run the type handler, settle the outcome.
//!
//! Handler failures never escape from here. They become RETRYING or FAILED on the
//! task itself. Only store and queue failures are returned, because those mean
//! the attempt could not be recorded at all.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatch::{DispatchQueue, RoutingPolicy};
use crate::error::{ExecuteError, HandlerError, StoreError};
use crate::models::{Task, TaskStatus};
use crate::payload::TaskKind;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state_machine::{CLAIM, FAIL, REDISPATCH, RETRY, SUCCEED};
use crate::store::{TaskStore, TaskUpdate, UpdateOutcome};
use crate::worker_processing::{self, Collaborators, TaskLog};

#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
  pub retry: RetryPolicy,
  pub routing: RoutingPolicy,
  /// Pause after a successful handler run, before SUCCESS is recorded.
  pub processing_delay: Duration,
  pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
  NotFound,
  Cancelled,
  AlreadyFinished(TaskStatus),
  /// Someone else changed the task first; nothing was done.
  Conflict(TaskStatus),
  Succeeded,
  Retrying { attempt: i32, delay: Duration },
  Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
  pub reason: String,
  /// Error chain plus backtrace, for the task log.
  pub detail: String,
}

/// What a handler run amounted to, with store errors already split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  Success(String),
  Retryable(Failure),
  Fatal(Failure),
}

impl Outcome {
  pub fn classify(result: Result<String, HandlerError>) -> Result<Outcome, StoreError> {
    let err = match result {
      Ok(output) => return Ok(Outcome::Success(output)),
      Err(HandlerError::Store(e)) => return Err(e),
      Err(err) => err,
    };
    let retryable = err.is_retryable();
    let reason = err.to_string();
    let detail = format!("{:?}", anyhow::Error::new(err));
    let failure = Failure { reason, detail };
    Ok(if retryable { Outcome::Retryable(failure) } else { Outcome::Fatal(failure) })
  }
}

pub struct Executor {
  store: Arc<dyn TaskStore>,
  queue: Arc<dyn DispatchQueue>,
  collaborators: Collaborators,
  config: ExecutorConfig,
}

impl Executor {
  pub fn new(
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    collaborators: Collaborators,
    config: ExecutorConfig,
  ) -> Self {
    Self { store, queue, collaborators, config }
  }

  pub async fn execute(&self, task_id: Uuid) -> Result<AttemptOutcome, ExecuteError> {
    let Some(task) = self.store.get(task_id).await? else {
      warn!(%task_id, "Task not found, dropping dispatch");
      return Ok(AttemptOutcome::NotFound);
    };

    match task.status {
      TaskStatus::Cancelled => {
        info!(%task_id, "Task was cancelled, skipping");
        return Ok(AttemptOutcome::Cancelled);
      }
      TaskStatus::Success | TaskStatus::Failed => {
        info!(%task_id, status = %task.status, "Task already finished, skipping");
        return Ok(AttemptOutcome::AlreadyFinished(task.status));
      }
      TaskStatus::Retrying => {
        let redispatch = REDISPATCH.update().with_log("Re-dispatched for retry");
        match self.store.update(task_id, &redispatch, REDISPATCH.expected()).await? {
          UpdateOutcome::Applied => {}
          outcome => return Ok(self.lost_race(task_id, outcome).await?),
        }
      }
      TaskStatus::Pending => {}
      TaskStatus::Scheduled | TaskStatus::Running => {
        warn!(%task_id, status = %task.status, "Task is not claimable, dropping dispatch");
        return Ok(AttemptOutcome::Conflict(task.status));
      }
    }

    let claim = CLAIM
      .update()
      .with_started_at(Utc::now())
      .with_log(format!("Task started (type={}) [Try {}]", task.task_type, task.attempt_label()));
    match self.store.update(task_id, &claim, CLAIM.expected()).await? {
      UpdateOutcome::Applied => {}
      outcome => return Ok(self.lost_race(task_id, outcome).await?),
    }
    info!(%task_id, task_type = %task.task_type, attempt = %task.attempt_label(), "Task claimed");

    let result = self.run_handler(&task).await;
    match Outcome::classify(result)? {
      Outcome::Success(output) => {
        if !self.config.processing_delay.is_zero() {
          tokio::time::sleep(self.config.processing_delay).await;
        }
        self.succeed(&task, output).await
      }
      Outcome::Retryable(failure) => match self.config.retry.decide(task.retries, task.max_retries) {
        RetryDecision::Retry { attempt, delay } => self.retry(&task, failure, attempt, delay).await,
        RetryDecision::Exhausted => self.fail(&task, failure).await,
      },
      Outcome::Fatal(failure) => self.fail(&task, failure).await,
    }
  }

  async fn run_handler(&self, task: &Task) -> Result<String, HandlerError> {
    let log = TaskLog::new(self.store.as_ref(), task.id);
    let attempt = async {
      let kind = TaskKind::parse(&task.task_type, &task.payload)?;
      worker_processing::process(&kind, task.id, &log, &self.collaborators).await
    };
    match self.config.timeout {
      Some(limit) => tokio::time::timeout(limit, attempt)
        .await
        .unwrap_or(Err(HandlerError::Timeout(limit))),
      None => attempt.await,
    }
  }

  async fn succeed(&self, task: &Task, output: String) -> Result<AttemptOutcome, ExecuteError> {
    let update = SUCCEED
      .update()
      .with_completed_at(Utc::now())
      .with_result(output)
      .with_log("Task finished successfully");
    match self.store.update(task.id, &update, SUCCEED.expected()).await? {
      UpdateOutcome::Applied => {
        info!(task_id = %task.id, "Task succeeded");
        Ok(AttemptOutcome::Succeeded)
      }
      outcome => Ok(self.lost_race(task.id, outcome).await?),
    }
  }

  async fn retry(
    &self,
    task: &Task,
    failure: Failure,
    attempt: i32,
    delay: Duration,
  ) -> Result<AttemptOutcome, ExecuteError> {
    let update = RETRY
      .update()
      .with_retries(attempt)
      .with_error(failure.reason.clone())
      .with_log(format!("Task failed: {}", failure.reason))
      .with_log(format!("Retrying... (Attempt {}/{})", attempt, task.max_retries));
    match self.store.update(task.id, &update, RETRY.expected()).await? {
      UpdateOutcome::Applied => {}
      outcome => return Ok(self.lost_race(task.id, outcome).await?),
    }
    warn!(task_id = %task.id, attempt, max_retries = task.max_retries, "Task failed, retrying in {:?}: {}", delay, failure.reason);

    let queue = self.config.routing.route(&task.task_type);
    let reference = self.queue.enqueue_delayed(queue, task.id, delay).await.map_err(|e| {
      error!(task_id = %task.id, "Failed to schedule retry: {}", e);
      e
    })?;
    self.store.update(task.id, &TaskUpdate::dispatch_reference(reference), None).await?;
    Ok(AttemptOutcome::Retrying { attempt, delay })
  }

  async fn fail(&self, task: &Task, failure: Failure) -> Result<AttemptOutcome, ExecuteError> {
    let update = FAIL
      .update()
      .with_error(failure.reason.clone())
      .with_log(format!("Task failed permanently:\n{}", failure.detail));
    match self.store.update(task.id, &update, FAIL.expected()).await? {
      UpdateOutcome::Applied => {
        error!(task_id = %task.id, "Task failed permanently: {}", failure.reason);
        Ok(AttemptOutcome::Failed)
      }
      outcome => Ok(self.lost_race(task.id, outcome).await?),
    }
  }

  async fn lost_race(&self, task_id: Uuid, outcome: UpdateOutcome) -> Result<AttemptOutcome, StoreError> {
    if outcome == UpdateOutcome::NotFound {
      warn!(%task_id, "Task disappeared mid-attempt");
      return Ok(AttemptOutcome::NotFound);
    }
    let Some(current) = self.store.get(task_id).await? else {
      return Ok(AttemptOutcome::NotFound);
    };
    warn!(%task_id, status = %current.status, "Concurrent update won, aborting attempt");
    Ok(match current.status {
      TaskStatus::Cancelled => AttemptOutcome::Cancelled,
      other => AttemptOutcome::Conflict(other),
    })
  }
}
