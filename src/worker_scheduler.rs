use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::dispatch::{Dispatch, DispatchQueue, QueuePriority, RoutingPolicy};
use crate::error::QueueError;
use crate::executor::Executor;

#[derive(Debug)]
pub struct ScheduledDispatch {
  pub priority: QueuePriority,
  pub sequence: u64,
  pub dispatch: Dispatch,
}

impl Eq for ScheduledDispatch {}

impl PartialEq for ScheduledDispatch {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.sequence == other.sequence
  }
}

impl PartialOrd for ScheduledDispatch {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// Higher priority first, then arrival order.
impl Ord for ScheduledDispatch {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.sequence.cmp(&self.sequence))
  }
}

#[derive(Default)]
pub struct Scheduler {
  queue: Mutex<BinaryHeap<ScheduledDispatch>>,
  sequence: AtomicU64,
}

impl Scheduler {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn add_task(&self, priority: QueuePriority, dispatch: Dispatch) {
    let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
    self.queue.lock().await.push(ScheduledDispatch { priority, sequence, dispatch });
  }

  pub async fn get_next(&self) -> Option<ScheduledDispatch> {
    self.queue.lock().await.pop()
  }

  pub async fn len(&self) -> usize {
    self.queue.lock().await.len()
  }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub worker_id: String,
  pub concurrency: usize,
  pub routing: RoutingPolicy,
}

/// Pulls dispatches from every routed queue into a local priority heap and
/// runs up to `concurrency` attempts at once.
pub struct WorkerPool {
  executor: Arc<Executor>,
  queue: Arc<dyn DispatchQueue>,
  config: WorkerConfig,
}

const IDLE_WAIT: Duration = Duration::from_millis(100);

impl WorkerPool {
  pub fn new(executor: Arc<Executor>, queue: Arc<dyn DispatchQueue>, config: WorkerConfig) -> Self {
    Self { executor, queue, config }
  }

  /// Runs until `shutdown` resolves, then waits for in-flight attempts to settle.
  ///
  /// A consumer that ends or fails before shutdown means the broker link is gone.
  /// The pool then stops the same way and returns the error, so the hosting
  /// process exits non-zero.
  pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), QueueError> {
    let scheduler = Arc::new(Scheduler::new());
    let mut consumers = JoinSet::new();

    for queue_name in self.config.routing.queues() {
      let tag = consumer_tag(&self.config.worker_id, &queue_name);
      let mut consumer = self.queue.consume(&queue_name, &tag).await?;
      let priority = self.config.routing.priority_of(&queue_name);
      let scheduler_consumer = scheduler.clone();
      consumers.spawn(async move {
        while let Some(delivery) = consumer.next().await {
          match delivery {
            Ok(dispatch) => scheduler_consumer.add_task(priority, dispatch).await,
            Err(e) => return e,
          }
        }
        QueueError::Closed(queue_name)
      });
    }

    let concurrency = self.config.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    info!(worker_id = %self.config.worker_id, concurrency, "Worker started");
    tokio::pin!(shutdown);
    let mut lost = None;

    loop {
      if let Some(scheduled) = scheduler.get_next().await {
        let permit = tokio::select! {
          permit = semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => break,
          },
          _ = &mut shutdown => {
            let _ = scheduled.dispatch.nack(true).await;
            break;
          }
        };
        let executor = self.executor.clone();
        tokio::spawn(async move {
          settle(&executor, scheduled.dispatch).await;
          drop(permit);
        });
        continue;
      }

      tokio::select! {
        _ = tokio::time::sleep(IDLE_WAIT) => {}
        _ = &mut shutdown => break,
        Some(ended) = consumers.join_next() => {
          let err = ended.unwrap_or_else(|e| QueueError::Unavailable(format!("consumer task failed: {e}")));
          error!(worker_id = %self.config.worker_id, "Consumer stopped before shutdown: {}", err);
          lost = Some(err);
          break;
        }
      }
    }

    consumers.abort_all();
    while let Some(scheduled) = scheduler.get_next().await {
      let _ = scheduled.dispatch.nack(true).await;
    }
    // Every permit back means every spawned attempt has finished.
    let _ = semaphore.acquire_many(concurrency as u32).await;
    info!(worker_id = %self.config.worker_id, "Worker stopped");
    lost.map_or(Ok(()), Err)
  }
}

/// Consumer tags must be unique per channel, and every routed queue shares one.
pub fn consumer_tag(worker_id: &str, queue: &str) -> String {
  format!("{worker_id}-{queue}")
}

async fn settle(executor: &Executor, dispatch: Dispatch) {
  let task_id = dispatch.message.task_id;
  match executor.execute(task_id).await {
    Ok(outcome) => {
      info!(%task_id, ?outcome, "Attempt settled");
      if let Err(e) = dispatch.ack().await {
        error!(%task_id, "Failed to ack dispatch: {:?}", e);
      }
    }
    Err(e) => {
      error!(%task_id, "Attempt aborted, returning dispatch to queue: {}", e);
      if let Err(e) = dispatch.nack(true).await {
        error!(%task_id, "Failed to nack dispatch: {:?}", e);
      }
    }
  }
}
