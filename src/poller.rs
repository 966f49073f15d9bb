use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchQueue, RoutingPolicy};
use crate::error::StoreError;
use crate::models::{Task, TaskStatus};
use crate::state_machine::DISPATCH;
use crate::store::{TaskStore, TaskUpdate, UpdateOutcome};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RECOVERY_GRACE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PollerConfig {
  pub interval: Duration,
  /// How long a PENDING or RETRYING task may sit untouched before it is re-enqueued.
  pub recovery_grace: Duration,
  pub archive_after: Option<Duration>,
  pub routing: RoutingPolicy,
}

impl Default for PollerConfig {
  fn default() -> Self {
    Self {
      interval: DEFAULT_POLL_INTERVAL,
      recovery_grace: DEFAULT_RECOVERY_GRACE,
      archive_after: None,
      routing: RoutingPolicy::default(),
    }
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
  pub dispatched: usize,
  /// Tasks another writer moved first (a second poller, or a cancel).
  pub conflicts: usize,
  pub enqueue_failures: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
  pub scan: ScanReport,
  pub recovered: ScanReport,
  pub archived: u64,
}

fn chrono_span(duration: Duration) -> chrono::Duration {
  chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub struct Poller {
  store: Arc<dyn TaskStore>,
  queue: Arc<dyn DispatchQueue>,
  config: PollerConfig,
}

impl Poller {
  pub fn new(store: Arc<dyn TaskStore>, queue: Arc<dyn DispatchQueue>, config: PollerConfig) -> Self {
    Self { store, queue, config }
  }

  /// Moves every due SCHEDULED task to PENDING and enqueues it.
  ///
  /// The status flip happens before the enqueue and is not undone if the
  /// enqueue fails. Such tasks stay PENDING and are picked up again by
  /// [`Poller::recover_stale`].
  pub async fn scan_and_dispatch(&self, now: DateTime<Utc>) -> Result<ScanReport, StoreError> {
    let mut report = ScanReport::default();
    for task in self.store.list_due(now).await? {
      let queue = self.config.routing.route(&task.task_type);
      let flip = DISPATCH.update().with_log(format!("Dispatched to queue '{queue}'"));
      match self.store.update(task.id, &flip, DISPATCH.expected()).await? {
        UpdateOutcome::Applied => {}
        UpdateOutcome::Conflict | UpdateOutcome::NotFound => {
          debug!(task_id = %task.id, "Task changed before dispatch, skipping");
          report.conflicts += 1;
          continue;
        }
      }
      if self.enqueue(&task, queue).await? {
        info!(task_id = %task.id, queue, "Dispatched scheduled task");
        report.dispatched += 1;
      } else {
        report.enqueue_failures += 1;
      }
    }
    Ok(report)
  }

  /// Re-enqueues PENDING/RETRYING tasks that saw no activity within the grace period.
  /// Extra deliveries are harmless: a worker only runs a task it can claim.
  pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<ScanReport, StoreError> {
    let mut report = ScanReport::default();
    let cutoff = now - chrono_span(self.config.recovery_grace);
    let stale = self
      .store
      .list_stale(&[TaskStatus::Pending, TaskStatus::Retrying], cutoff)
      .await?;
    for task in stale {
      let queue = self.config.routing.route(&task.task_type);
      warn!(task_id = %task.id, status = %task.status, "Task stalled without worker activity, re-dispatching");
      if self.enqueue(&task, queue).await? {
        report.dispatched += 1;
      } else {
        report.enqueue_failures += 1;
      }
    }
    Ok(report)
  }

  pub async fn archive(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
    let Some(after) = self.config.archive_after else {
      return Ok(0);
    };
    let moved = self.store.archive_finished(now - chrono_span(after)).await?;
    if moved > 0 {
      info!(moved, "Archived finished tasks");
    }
    Ok(moved)
  }

  pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
    Ok(TickReport {
      scan: self.scan_and_dispatch(now).await?,
      recovered: self.recover_stale(now).await?,
      archived: self.archive(now).await?,
    })
  }

  /// Ticks on the configured interval until `shutdown` resolves. Store errors end
  /// the loop and are returned to the hosting process.
  pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), StoreError> {
    let mut interval = tokio::time::interval(self.config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);
    info!(interval = ?self.config.interval, "Poller started");
    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("Poller stopping");
          return Ok(());
        }
        _ = interval.tick() => {
          let report = self.tick(Utc::now()).await?;
          if report != TickReport::default() {
            debug!(?report, "Poll cycle complete");
          }
        }
      }
    }
  }

  /// Returns whether the message went out. The reference is recorded whatever
  /// the task's status is by now, since a fast worker may already hold it.
  async fn enqueue(&self, task: &Task, queue: &str) -> Result<bool, StoreError> {
    match self.queue.enqueue(queue, task.id).await {
      Ok(reference) => {
        self.store.update(task.id, &TaskUpdate::dispatch_reference(reference), None).await?;
        Ok(true)
      }
      Err(e) => {
        error!(task_id = %task.id, queue, "Failed to enqueue task: {}", e);
        Ok(false)
      }
    }
  }
}
