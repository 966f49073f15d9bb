//! Handoff between the poller and the workers.
//!
//! The queue carries nothing but a task id; all state lives in the task store.
//! Delivery is at-least-once, so consumers must treat a message as a hint and
//! re-check the task's status before doing anything.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpDispatchQueue;
pub use memory::MemoryDispatchQueue;

pub const DEFAULT_QUEUE: &str = "task_queue";
pub const URGENT_QUEUE: &str = "urgent";
pub const NORMAL_QUEUE: &str = "normal";
pub const BATCH_QUEUE: &str = "batch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
  pub reference: String,
  pub task_id: Uuid,
  pub queue: String,
  pub enqueued_at: DateTime<Utc>,
}

impl DispatchMessage {
  pub fn new(queue: &str, task_id: Uuid) -> Self {
    Self {
      reference: Uuid::new_v4().to_string(),
      task_id,
      queue: queue.to_string(),
      enqueued_at: Utc::now(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueuePriority {
  Batch,
  Normal,
  Urgent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingPolicy {
  /// Everything goes to one general-purpose queue.
  Single(String),
  /// `send_email` is urgent, `send_message` normal, everything else batch.
  Priority,
}

impl Default for RoutingPolicy {
  fn default() -> Self {
    RoutingPolicy::Single(DEFAULT_QUEUE.to_string())
  }
}

impl RoutingPolicy {
  pub fn route(&self, task_type: &str) -> &str {
    match self {
      RoutingPolicy::Single(queue) => queue,
      RoutingPolicy::Priority => match task_type {
        "send_email" => URGENT_QUEUE,
        "send_message" => NORMAL_QUEUE,
        _ => BATCH_QUEUE,
      },
    }
  }

  pub fn queues(&self) -> Vec<String> {
    match self {
      RoutingPolicy::Single(queue) => vec![queue.clone()],
      RoutingPolicy::Priority => [URGENT_QUEUE, NORMAL_QUEUE, BATCH_QUEUE].map(String::from).to_vec(),
    }
  }

  pub fn priority_of(&self, queue: &str) -> QueuePriority {
    match queue {
      URGENT_QUEUE => QueuePriority::Urgent,
      BATCH_QUEUE => QueuePriority::Batch,
      _ => QueuePriority::Normal,
    }
  }
}

#[async_trait]
pub trait Acknowledge: Send + Sync {
  async fn ack(&self) -> Result<(), QueueError>;
  async fn nack(&self, requeue: bool) -> Result<(), QueueError>;
}

/// A received message that must be acked once the attempt is settled.
pub struct Dispatch {
  pub message: DispatchMessage,
  acker: Box<dyn Acknowledge>,
}

impl fmt::Debug for Dispatch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Dispatch").field("message", &self.message).finish_non_exhaustive()
  }
}

impl Dispatch {
  pub fn new(message: DispatchMessage, acker: Box<dyn Acknowledge>) -> Self {
    Self { message, acker }
  }

  pub async fn ack(self) -> Result<(), QueueError> {
    self.acker.ack().await
  }

  pub async fn nack(self, requeue: bool) -> Result<(), QueueError> {
    self.acker.nack(requeue).await
  }
}

#[async_trait]
pub trait QueueConsumer: Send {
  /// `None` once the underlying queue is closed.
  async fn next(&mut self) -> Option<Result<Dispatch, QueueError>>;
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
  /// Publishes `task_id` to `queue` and returns the message reference.
  async fn enqueue(&self, queue: &str, task_id: Uuid) -> Result<String, QueueError>;

  /// Like [`DispatchQueue::enqueue`] but the message only becomes visible after `delay`.
  async fn enqueue_delayed(&self, queue: &str, task_id: Uuid, delay: Duration) -> Result<String, QueueError>;

  async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn QueueConsumer>, QueueError>;
}
