use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use dtsched::dispatch::{DEFAULT_QUEUE, DispatchQueue, MemoryDispatchQueue, QueueConsumer, RoutingPolicy};
use dtsched::error::{HandlerError, QueueError};
use dtsched::executor::{AttemptOutcome, Executor, ExecutorConfig};
use dtsched::mail::MailTransport;
use dtsched::models::{LogEntry, NewTask, Task, TaskStatus};
use dtsched::owner_actions;
use dtsched::poller::{Poller, PollerConfig};
use dtsched::report::ReportRenderer;
use dtsched::retry::RetryPolicy;
use dtsched::state_machine::CLAIM;
use dtsched::store::{MemoryTaskStore, TaskStore, UpdateOutcome};
use dtsched::worker_processing::Collaborators;
use dtsched::worker_scheduler::{WorkerConfig, WorkerPool};

const OWNER: &str = "alice";

#[derive(Default)]
struct FakeMail {
  failures_left: AtomicUsize,
  sent: Mutex<Vec<String>>,
}

#[async_trait]
impl MailTransport for FakeMail {
  async fn send(&self, to: &str, _subject: &str, _body: &str) -> Result<(), HandlerError> {
    if !to.contains('@') {
      return Err(HandlerError::InvalidAddress { address: to.into(), reason: "missing domain".into() });
    }
    if self
      .failures_left
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(HandlerError::Transport("connection refused".into()));
    }
    self.sent.lock().unwrap().push(to.to_string());
    Ok(())
  }
}

struct SlowRenderer {
  takes: Duration,
}

#[async_trait]
impl ReportRenderer for SlowRenderer {
  async fn render(&self, _title: &str, _content: &str, task_id: Uuid) -> Result<PathBuf, HandlerError> {
    tokio::time::sleep(self.takes).await;
    Ok(PathBuf::from(format!("reports/report_{task_id}.pdf")))
  }
}

struct Harness {
  store: Arc<MemoryTaskStore>,
  queue: MemoryDispatchQueue,
  mail: Arc<FakeMail>,
  executor: Arc<Executor>,
}

impl Harness {
  fn new(config: ExecutorConfig) -> Self {
    Self::with_renderer(config, Duration::ZERO)
  }

  fn with_renderer(config: ExecutorConfig, render_time: Duration) -> Self {
    let store = Arc::new(MemoryTaskStore::new());
    let queue = MemoryDispatchQueue::new();
    let mail = Arc::new(FakeMail::default());
    let collaborators = Collaborators {
      mail: mail.clone(),
      reports: Arc::new(SlowRenderer { takes: render_time }),
    };
    let executor = Arc::new(Executor::new(store.clone(), Arc::new(queue.clone()), collaborators, config));
    Self { store, queue, mail, executor }
  }

  fn poller(&self) -> Poller {
    Poller::new(self.store.clone(), Arc::new(self.queue.clone()), PollerConfig::default())
  }

  async fn submit(&self, task_type: &str, payload: Value, max_retries: Option<i32>) -> Task {
    let new_task = NewTask {
      task_type: task_type.into(),
      payload,
      run_at: Utc::now() - ChronoDuration::seconds(1),
      max_retries,
    };
    assert_ok!(owner_actions::submit(self.store.as_ref(), OWNER, new_task).await)
  }

  /// Submits a due task and runs one poll so it ends up PENDING with a dispatch waiting.
  async fn dispatched(&self, task_type: &str, payload: Value, max_retries: Option<i32>) -> Task {
    let task = self.submit(task_type, payload, max_retries).await;
    let report = assert_ok!(self.poller().scan_and_dispatch(Utc::now()).await);
    assert_eq!(report.dispatched, 1);
    self.task(task.id).await
  }

  async fn task(&self, id: Uuid) -> Task {
    self.store.get(id).await.unwrap().unwrap()
  }
}

fn messages(logs: &[LogEntry]) -> Vec<String> {
  logs.iter().map(|entry| entry.message.clone()).collect()
}

#[tokio::test]
async fn send_message_runs_to_success() {
  let harness = Harness::new(ExecutorConfig::default());
  let task = harness.dispatched("send_message", json!("hi"), None).await;
  assert_eq!(task.status, TaskStatus::Pending);

  let outcome = assert_ok!(harness.executor.execute(task.id).await);
  assert_eq!(outcome, AttemptOutcome::Succeeded);

  let task = harness.task(task.id).await;
  assert_eq!(task.status, TaskStatus::Success);
  assert_eq!(task.result.as_deref(), Some("Message sent: hi"));
  assert!(task.started_at.is_some());
  assert!(task.completed_at.is_some());
  assert_eq!(
    messages(&task.logs),
    [
      "Dispatched to queue 'task_queue'",
      "Task started (type=send_message) [Try 1/4]",
      "Sending message...",
      "Message delivered successfully",
      "Task finished successfully",
    ]
  );
}

#[tokio::test(start_paused = true)]
async fn missing_recipient_retries_until_failed() {
  let harness = Harness::new(ExecutorConfig::default());
  let task = harness.dispatched("send_email", json!({"subject": "Hi"}), None).await;
  let mut previous_logs = harness.task(task.id).await.logs;
  let mut first_started_at = None;

  for attempt in 1..=3 {
    let outcome = assert_ok!(harness.executor.execute(task.id).await);
    assert_eq!(outcome, AttemptOutcome::Retrying { attempt, delay: Duration::from_secs(5) });

    let current = harness.task(task.id).await;
    assert_eq!(current.status, TaskStatus::Retrying);
    assert_eq!(current.retries, attempt);
    assert!(current.retries <= current.max_retries);
    assert_eq!(current.error_message.as_deref(), Some("Recipient email missing in payload"));

    let started_at = current.started_at.expect("claim sets started_at");
    assert_eq!(*first_started_at.get_or_insert(started_at), started_at);

    assert!(current.logs.len() > previous_logs.len());
    assert_eq!(&current.logs[..previous_logs.len()], previous_logs.as_slice());
    previous_logs = current.logs;
  }

  let outcome = assert_ok!(harness.executor.execute(task.id).await);
  assert_eq!(outcome, AttemptOutcome::Failed);
  let failed = harness.task(task.id).await;
  assert_eq!(failed.status, TaskStatus::Failed);
  assert_eq!(failed.retries, failed.max_retries);
  assert_eq!(failed.started_at, first_started_at);
  assert!(failed.error_message.unwrap().contains("Recipient email missing"));
  assert_eq!(&failed.logs[..previous_logs.len()], previous_logs.as_slice());
  assert!(failed.logs.last().unwrap().message.starts_with("Task failed permanently:"));

  // A late duplicate delivery does nothing.
  let duplicate = assert_ok!(harness.executor.execute(task.id).await);
  assert_eq!(duplicate, AttemptOutcome::AlreadyFinished(TaskStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn retry_is_redelivered_after_the_delay() {
  let harness = Harness::new(ExecutorConfig {
    retry: RetryPolicy::fixed(Duration::from_secs(30)),
    ..ExecutorConfig::default()
  });
  harness.mail.failures_left.store(1, Ordering::SeqCst);
  let task = harness.dispatched("send_email", json!({"to": "bob@example.com"}), Some(2)).await;
  let first = harness.queue.waiting(DEFAULT_QUEUE).await;
  assert_eq!(first.len(), 1);

  let outcome = assert_ok!(harness.executor.execute(task.id).await);
  assert_eq!(outcome, AttemptOutcome::Retrying { attempt: 1, delay: Duration::from_secs(30) });

  tokio::time::sleep(Duration::from_secs(29)).await;
  assert_eq!(harness.queue.waiting(DEFAULT_QUEUE).await.len(), 1);
  tokio::time::sleep(Duration::from_secs(2)).await;
  let waiting = harness.queue.waiting(DEFAULT_QUEUE).await;
  assert_eq!(waiting.len(), 2);

  let retrying = harness.task(task.id).await;
  assert_eq!(retrying.dispatch_reference.as_deref(), Some(waiting[1].reference.as_str()));

  let outcome = assert_ok!(harness.executor.execute(task.id).await);
  assert_eq!(outcome, AttemptOutcome::Succeeded);
  let done = harness.task(task.id).await;
  assert_eq!(done.status, TaskStatus::Success);
  assert_eq!(done.retries, 1);
  assert_eq!(done.result.as_deref(), Some("Email sent successfully to bob@example.com"));
  assert!(messages(&done.logs).contains(&"Re-dispatched for retry".to_string()));
  assert!(messages(&done.logs).contains(&"Task started (type=send_email) [Try 2/3]".to_string()));
  assert_eq!(harness.mail.sent.lock().unwrap().as_slice(), ["bob@example.com"]);
}

#[tokio::test]
async fn zero_retries_fails_on_first_error() {
  let harness = Harness::new(ExecutorConfig::default());
  harness.mail.failures_left.store(5, Ordering::SeqCst);
  let task = harness.dispatched("send_email", json!({"to": "bob@example.com"}), Some(0)).await;

  assert_eq!(assert_ok!(harness.executor.execute(task.id).await), AttemptOutcome::Failed);
  let failed = harness.task(task.id).await;
  assert_eq!(failed.retries, 0);
  assert_eq!(failed.status, TaskStatus::Failed);
}

#[tokio::test]
async fn invalid_address_is_not_retried() {
  let harness = Harness::new(ExecutorConfig::default());
  let task = harness.dispatched("send_email", json!({"to": "nobody"}), None).await;

  assert_eq!(assert_ok!(harness.executor.execute(task.id).await), AttemptOutcome::Failed);
  let failed = harness.task(task.id).await;
  assert_eq!(failed.retries, 0);
  assert!(failed.error_message.unwrap().contains("invalid email address 'nobody'"));
}

#[tokio::test(start_paused = true)]
async fn slow_handler_times_out_into_a_retry() {
  let config = ExecutorConfig { timeout: Some(Duration::from_secs(1)), ..ExecutorConfig::default() };
  let harness = Harness::with_renderer(config, Duration::from_secs(10));
  let task = harness.dispatched("generate_report", json!({"title": "Q3"}), None).await;

  let outcome = assert_ok!(harness.executor.execute(task.id).await);
  assert!(matches!(outcome, AttemptOutcome::Retrying { attempt: 1, .. }));
  let retrying = harness.task(task.id).await;
  assert!(retrying.error_message.unwrap().contains("execution exceeded"));
}

#[tokio::test]
async fn cancelled_task_never_runs() {
  let harness = Harness::new(ExecutorConfig::default());
  let task = harness.dispatched("send_message", json!("hi"), None).await;
  let cancelled = assert_ok!(owner_actions::cancel(harness.store.as_ref(), OWNER, task.id).await);
  assert_eq!(cancelled.status, TaskStatus::Cancelled);

  // The dispatch made before the cancel is still in the queue.
  assert_eq!(harness.queue.waiting(DEFAULT_QUEUE).await.len(), 1);
  let outcome = assert_ok!(harness.executor.execute(task.id).await);
  assert_eq!(outcome, AttemptOutcome::Cancelled);

  let after = harness.task(task.id).await;
  assert_eq!(after.status, TaskStatus::Cancelled);
  assert!(after.started_at.is_none());
  assert!(after.result.is_none());
}

#[tokio::test]
async fn cancelled_scheduled_task_is_never_dispatched() {
  let harness = Harness::new(ExecutorConfig::default());
  let new_task = NewTask {
    task_type: "send_message".into(),
    payload: json!("later"),
    run_at: Utc::now() + ChronoDuration::minutes(30),
    max_retries: None,
  };
  let task = assert_ok!(owner_actions::submit(harness.store.as_ref(), OWNER, new_task).await);
  assert_ok!(owner_actions::cancel(harness.store.as_ref(), OWNER, task.id).await);

  let report = assert_ok!(harness.poller().tick(Utc::now() + ChronoDuration::hours(1)).await);
  assert_eq!(report.scan.dispatched, 0);
  assert_eq!(harness.task(task.id).await.status, TaskStatus::Cancelled);
  assert!(harness.queue.waiting(DEFAULT_QUEUE).await.is_empty());
}

#[tokio::test]
async fn only_one_claim_wins() {
  let harness = Harness::new(ExecutorConfig::default());
  let task = harness.dispatched("send_message", json!("hi"), None).await;

  let claim = CLAIM.update();
  let (first, second) = tokio::join!(
    harness.store.update(task.id, &claim, CLAIM.expected()),
    harness.store.update(task.id, &claim, CLAIM.expected()),
  );
  let mut outcomes = [first.unwrap(), second.unwrap()];
  outcomes.sort_by_key(|o| *o != UpdateOutcome::Applied);
  assert_eq!(outcomes, [UpdateOutcome::Applied, UpdateOutcome::Conflict]);
}

#[tokio::test]
async fn concurrent_attempts_run_the_handler_once() {
  let harness = Harness::new(ExecutorConfig::default());
  let task = harness.dispatched("send_email", json!({"to": "bob@example.com"}), None).await;

  let (a, b) = tokio::join!(harness.executor.execute(task.id), harness.executor.execute(task.id));
  let outcomes = [a.unwrap(), b.unwrap()];
  let wins = outcomes.iter().filter(|o| **o == AttemptOutcome::Succeeded).count();
  assert_eq!(wins, 1);
  assert!(
    outcomes
      .iter()
      .any(|o| matches!(o, AttemptOutcome::Conflict(_) | AttemptOutcome::AlreadyFinished(_)))
  );
  assert_eq!(harness.mail.sent.lock().unwrap().len(), 1);
  let started = harness
    .task(task.id)
    .await
    .logs
    .iter()
    .filter(|entry| entry.message.starts_with("Task started"))
    .count();
  assert_eq!(started, 1);
}

#[tokio::test]
async fn unknown_task_id_is_reported_not_found() {
  let harness = Harness::new(ExecutorConfig::default());
  let outcome = assert_ok!(harness.executor.execute(Uuid::new_v4()).await);
  assert_eq!(outcome, AttemptOutcome::NotFound);
}

#[tokio::test]
async fn closed_queue_aborts_the_retry_write() {
  let harness = Harness::new(ExecutorConfig::default());
  harness.mail.failures_left.store(1, Ordering::SeqCst);
  let task = harness.dispatched("send_email", json!({"to": "bob@example.com"}), None).await;
  harness.queue.refuse_enqueues(true);

  assert_err!(harness.executor.execute(task.id).await);
  // The RETRYING state is already recorded; recovery re-enqueues it later.
  assert_eq!(harness.task(task.id).await.status, TaskStatus::Retrying);
}

#[tokio::test(start_paused = true)]
async fn worker_pool_drains_priority_queues() {
  let routing = RoutingPolicy::Priority;
  let harness = Harness::new(ExecutorConfig { routing: routing.clone(), ..ExecutorConfig::default() });
  let poller = Poller::new(
    harness.store.clone(),
    Arc::new(harness.queue.clone()),
    PollerConfig { routing: routing.clone(), ..PollerConfig::default() },
  );

  let message = harness.submit("send_message", json!("hi"), None).await;
  let email = harness.submit("send_email", json!({"to": "bob@example.com"}), None).await;
  let report = harness.submit("generate_report", Value::Null, None).await;
  let scan = assert_ok!(poller.scan_and_dispatch(Utc::now()).await);
  assert_eq!(scan.dispatched, 3);
  assert_eq!(harness.queue.waiting("urgent").await.len(), 1);
  assert_eq!(harness.queue.waiting("normal").await.len(), 1);
  assert_eq!(harness.queue.waiting("batch").await.len(), 1);

  let pool = WorkerPool::new(
    harness.executor.clone(),
    Arc::new(harness.queue.clone()),
    WorkerConfig { worker_id: "worker-test".into(), concurrency: 2, routing },
  );
  let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
  let running = tokio::spawn(async move {
    pool
      .run(async {
        let _ = stopped.await;
      })
      .await
  });

  for _ in 0..100 {
    let mut done = true;
    for id in [message.id, email.id, report.id] {
      done &= harness.task(id).await.status.is_terminal();
    }
    if done {
      break;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  let _ = stop.send(());
  assert_ok!(running.await.unwrap());

  for id in [message.id, email.id, report.id] {
    assert_eq!(harness.task(id).await.status, TaskStatus::Success);
  }
  let report_task = harness.task(report.id).await;
  assert_eq!(
    report_task.result,
    Some(format!("PDF Report Generated: reports/report_{}.pdf", report.id))
  );
  let messages = messages(&harness.task(email.id).await.logs);
  assert_eq!(messages[0], "Dispatched to queue 'urgent'");
}

/// Remembers the consumer tag used for each queue.
struct TagRecorder {
  inner: MemoryDispatchQueue,
  tags: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DispatchQueue for TagRecorder {
  async fn enqueue(&self, queue: &str, task_id: Uuid) -> Result<String, QueueError> {
    self.inner.enqueue(queue, task_id).await
  }

  async fn enqueue_delayed(&self, queue: &str, task_id: Uuid, delay: Duration) -> Result<String, QueueError> {
    self.inner.enqueue_delayed(queue, task_id, delay).await
  }

  async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn QueueConsumer>, QueueError> {
    self.tags.lock().unwrap().push((queue.to_string(), consumer_tag.to_string()));
    self.inner.consume(queue, consumer_tag).await
  }
}

#[tokio::test(start_paused = true)]
async fn worker_pool_uses_a_distinct_consumer_tag_per_queue() {
  let harness = Harness::new(ExecutorConfig::default());
  let queue = Arc::new(TagRecorder { inner: harness.queue.clone(), tags: Mutex::new(Vec::new()) });
  let pool = WorkerPool::new(
    harness.executor.clone(),
    queue.clone(),
    WorkerConfig { worker_id: "w1".into(), concurrency: 1, routing: RoutingPolicy::Priority },
  );
  assert_ok!(pool.run(tokio::time::sleep(Duration::from_secs(1))).await);

  let tags = queue.tags.lock().unwrap().clone();
  assert_eq!(tags.len(), 3);
  let distinct: HashSet<&String> = tags.iter().map(|(_, tag)| tag).collect();
  assert_eq!(distinct.len(), tags.len());
  assert!(tags.iter().all(|(queue, tag)| tag.starts_with("w1") && tag.ends_with(queue.as_str())));
}

#[tokio::test(start_paused = true)]
async fn worker_pool_fails_when_the_queue_goes_away() {
  let harness = Harness::new(ExecutorConfig::default());
  let pool = WorkerPool::new(
    harness.executor.clone(),
    Arc::new(harness.queue.clone()),
    WorkerConfig { worker_id: "w1".into(), concurrency: 1, routing: RoutingPolicy::default() },
  );
  let running = tokio::spawn(async move { pool.run(std::future::pending()).await });
  tokio::time::sleep(Duration::from_millis(250)).await;
  harness.queue.close();

  let result = running.await.unwrap();
  assert!(matches!(result, Err(QueueError::Closed(queue)) if queue == DEFAULT_QUEUE));
}

#[tokio::test]
async fn stale_pending_task_is_recovered_and_run() {
  let harness = Harness::new(ExecutorConfig::default());
  harness.queue.refuse_enqueues(true);
  let task = harness.submit("send_message", json!("late"), None).await;
  let scan = assert_ok!(harness.poller().scan_and_dispatch(Utc::now()).await);
  assert_eq!(scan.enqueue_failures, 1);
  harness.queue.refuse_enqueues(false);

  let recovered = assert_ok!(harness.poller().recover_stale(Utc::now() + ChronoDuration::minutes(10)).await);
  assert_eq!(recovered.dispatched, 1);
  let waiting = harness.queue.waiting(DEFAULT_QUEUE).await;
  assert_eq!(waiting.len(), 1);

  assert_eq!(assert_ok!(harness.executor.execute(waiting[0].task_id).await), AttemptOutcome::Succeeded);
  assert_eq!(harness.task(task.id).await.result.as_deref(), Some("Message sent: late"));
}
