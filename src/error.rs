use std::time::Duration;

use uuid::Uuid;

/// Failures of the task store itself. These are infrastructure errors and are
/// never turned into task state; they bubble up to the hosting process.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("corrupt task record {id}: {reason}")]
  Corrupt { id: Uuid, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("broker error: {0}")]
  Broker(#[from] lapin::Error),

  #[error("dispatch message encoding error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("broker rejected message for queue '{0}'")]
  Rejected(String),

  #[error("queue '{0}' is closed")]
  Closed(String),

  #[error("enqueue refused: {0}")]
  Unavailable(String),
}

/// Errors raised while running a task's type-specific logic.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
  #[error("{0}")]
  Validation(String),

  #[error("transport failure: {0}")]
  Transport(String),

  #[error("invalid email address '{address}': {reason}")]
  InvalidAddress { address: String, reason: String },

  #[error("execution exceeded {0:?}")]
  Timeout(Duration),

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl HandlerError {
  /// Whether another attempt could plausibly succeed.
  pub fn is_retryable(&self) -> bool {
    !matches!(self, HandlerError::InvalidAddress { .. })
  }
}

/// Errors that abort a worker attempt without being recorded on the task.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("re-dispatch failed: {0}")]
  Queue(#[from] QueueError),
}
