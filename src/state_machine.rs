//! Legal task lifecycle transitions and the guards around owner cancellation.
//!
//! ```text
//! SCHEDULED --dispatch--> PENDING --claim--> RUNNING --succeed--> SUCCESS
//!                                            RUNNING --retry----> RETRYING --redispatch--> PENDING
//!                                            RUNNING --fail-----> FAILED
//! SCHEDULED | PENDING --cancel--> CANCELLED
//! ```
//!
//! Every write to a task's status is conditional on the `from` side of one of
//! these transitions, which is what keeps racing pollers and workers honest.

use crate::models::{Task, TaskStatus};
use crate::store::TaskUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
  pub from: TaskStatus,
  pub to: TaskStatus,
}

pub const DISPATCH: Transition = Transition { from: TaskStatus::Scheduled, to: TaskStatus::Pending };
pub const CLAIM: Transition = Transition { from: TaskStatus::Pending, to: TaskStatus::Running };
pub const SUCCEED: Transition = Transition { from: TaskStatus::Running, to: TaskStatus::Success };
pub const RETRY: Transition = Transition { from: TaskStatus::Running, to: TaskStatus::Retrying };
pub const FAIL: Transition = Transition { from: TaskStatus::Running, to: TaskStatus::Failed };
pub const REDISPATCH: Transition = Transition { from: TaskStatus::Retrying, to: TaskStatus::Pending };

pub fn is_legal(from: TaskStatus, to: TaskStatus) -> bool {
  use TaskStatus::*;
  matches!(
    (from, to),
    (Scheduled, Pending)
      | (Scheduled, Cancelled)
      | (Pending, Running)
      | (Pending, Cancelled)
      | (Running, Success)
      | (Running, Retrying)
      | (Running, Failed)
      | (Retrying, Pending)
  )
}

impl Transition {
  pub fn between(from: TaskStatus, to: TaskStatus) -> Option<Transition> {
    is_legal(from, to).then_some(Transition { from, to })
  }

  pub fn expected(&self) -> Option<TaskStatus> {
    Some(self.from)
  }

  /// A store update that moves the task to `to`; callers add the other fields.
  pub fn update(&self) -> TaskUpdate {
    TaskUpdate::status(self.to)
  }
}

pub fn is_cancellable(status: TaskStatus) -> bool {
  matches!(status, TaskStatus::Scheduled | TaskStatus::Pending)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelRefusal {
  #[error("Not allowed")]
  NotOwner,

  #[error("Task already {0}, cannot cancel")]
  NotCancellable(TaskStatus),
}

/// Decides whether `owner_id` may cancel `task` right now.
pub fn cancel_transition(task: &Task, owner_id: &str) -> Result<Transition, CancelRefusal> {
  if task.owner_id.as_deref() != Some(owner_id) {
    return Err(CancelRefusal::NotOwner);
  }
  if !is_cancellable(task.status) {
    return Err(CancelRefusal::NotCancellable(task.status));
  }
  Transition::between(task.status, TaskStatus::Cancelled).ok_or(CancelRefusal::NotCancellable(task.status))
}
