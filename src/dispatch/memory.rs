use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::{Acknowledge, Dispatch, DispatchMessage, DispatchQueue, QueueConsumer};
use crate::error::QueueError;

#[derive(Default)]
struct Inner {
  queues: Mutex<HashMap<String, VecDeque<DispatchMessage>>>,
  notify: Notify,
  closed: AtomicBool,
  refuse_enqueue: AtomicBool,
}

impl Inner {
  async fn push(&self, message: DispatchMessage) {
    self.queues.lock().await.entry(message.queue.clone()).or_default().push_back(message);
    self.notify.notify_waiters();
  }

  async fn pop(&self, queue: &str) -> Option<DispatchMessage> {
    self.queues.lock().await.get_mut(queue).and_then(VecDeque::pop_front)
  }
}

/// In-process queue with the same at-least-once contract as the broker:
/// a nacked message with `requeue` goes back to the tail of its queue.
#[derive(Clone, Default)]
pub struct MemoryDispatchQueue {
  inner: Arc<Inner>,
}

impl MemoryDispatchQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Messages currently waiting in `queue` (delayed ones appear once their delay elapses).
  pub async fn waiting(&self, queue: &str) -> Vec<DispatchMessage> {
    self.inner.queues.lock().await.get(queue).map(|q| q.iter().cloned().collect()).unwrap_or_default()
  }

  /// Makes every later enqueue fail, to exercise broker outages.
  pub fn refuse_enqueues(&self, refuse: bool) {
    self.inner.refuse_enqueue.store(refuse, Ordering::SeqCst);
  }

  /// Ends all consumers once their queues are drained.
  pub fn close(&self) {
    self.inner.closed.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }

  fn check_open(&self, queue: &str) -> Result<(), QueueError> {
    if self.inner.closed.load(Ordering::SeqCst) {
      return Err(QueueError::Closed(queue.to_string()));
    }
    if self.inner.refuse_enqueue.load(Ordering::SeqCst) {
      return Err(QueueError::Unavailable(format!("queue '{queue}' refused the message")));
    }
    Ok(())
  }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
  async fn enqueue(&self, queue: &str, task_id: Uuid) -> Result<String, QueueError> {
    self.check_open(queue)?;
    let message = DispatchMessage::new(queue, task_id);
    let reference = message.reference.clone();
    self.inner.push(message).await;
    Ok(reference)
  }

  async fn enqueue_delayed(&self, queue: &str, task_id: Uuid, delay: Duration) -> Result<String, QueueError> {
    self.check_open(queue)?;
    let message = DispatchMessage::new(queue, task_id);
    let reference = message.reference.clone();
    let inner = self.inner.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      inner.push(message).await;
    });
    Ok(reference)
  }

  async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<Box<dyn QueueConsumer>, QueueError> {
    Ok(Box::new(MemoryConsumer {
      inner: self.inner.clone(),
      queue: queue.to_string(),
    }))
  }
}

struct MemoryConsumer {
  inner: Arc<Inner>,
  queue: String,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
  async fn next(&mut self) -> Option<Result<Dispatch, QueueError>> {
    loop {
      let notified = self.inner.notify.notified();
      if let Some(message) = self.inner.pop(&self.queue).await {
        let acker = MemoryAcker {
          inner: self.inner.clone(),
          message: message.clone(),
        };
        return Some(Ok(Dispatch::new(message, Box::new(acker))));
      }
      if self.inner.closed.load(Ordering::SeqCst) {
        return None;
      }
      notified.await;
    }
  }
}

struct MemoryAcker {
  inner: Arc<Inner>,
  message: DispatchMessage,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
  async fn ack(&self) -> Result<(), QueueError> {
    Ok(())
  }

  async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
    if requeue {
      self.inner.push(self.message.clone()).await;
    }
    Ok(())
  }
}
