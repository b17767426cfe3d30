//! Task records and the registry that owns them.
//!
//! Transitions: `queued → running → {succeeded | failed}`, `queued → cancelled`,
//! and `running → cancelled` only at a retry boundary after a cancel request.
//! All transitions happen under the registry lock; each record publishes its
//! status on a `watch` channel for waiters.

use std::collections::HashMap;
use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use super::params::ComputationKind;
use super::params::Lane;
use crate::error::ComputeError;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  Queued,
  Running,
  Succeeded,
  Failed,
  Cancelled,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
  }

  pub fn is_active(self) -> bool {
    matches!(self, Self::Queued | Self::Running)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Queued => "queued",
      Self::Running => "running",
      Self::Succeeded => "succeeded",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
  pub error_kind: ErrorKind,
  pub message: String,
}

impl From<&ComputeError> for TaskFailure {
  fn from(err: &ComputeError) -> Self {
    Self {
      error_kind: err.kind(),
      message: err.to_string(),
    }
  }
}

/// One submitted computation, keyed by its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputationTask {
  pub id: String,
  pub kind: ComputationKind,
  pub lane: Lane,
  pub status: TaskStatus,
  pub result: Option<Value>,
  pub failure: Option<TaskFailure>,
  pub attempts: u32,
  pub cancel_requested: bool,
  pub submitted_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl ComputationTask {
  fn new(id: String, kind: ComputationKind) -> Self {
    Self {
      id,
      kind,
      lane: kind.lane(),
      status: TaskStatus::Queued,
      result: None,
      failure: None,
      attempts: 0,
      cancel_requested: false,
      submitted_at: Utc::now(),
      started_at: None,
      completed_at: None,
    }
  }

  pub fn status_view(&self) -> TaskStatusView {
    TaskStatusView {
      task_id: self.id.clone(),
      status: self.status,
      submitted_at: self.submitted_at,
      started_at: self.started_at,
      completed_at: self.completed_at,
      attempts: self.attempts,
    }
  }

  pub fn outcome(&self) -> TaskResult {
    match (self.status, &self.result, &self.failure) {
      (TaskStatus::Succeeded, Some(result), _) => TaskResult::Succeeded { result: result.clone() },
      (TaskStatus::Failed, _, Some(failure)) => TaskResult::Failed { error: failure.clone() },
      (TaskStatus::Cancelled, _, _) => TaskResult::Cancelled,
      (status, _, _) => TaskResult::Pending { status },
    }
  }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
  pub task_id: String,
  pub status: TaskStatus,
  pub submitted_at: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  pub attempts: u32,
}

/// Answer to a result query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResult {
  Pending { status: TaskStatus },
  Succeeded { result: Value },
  Failed { error: TaskFailure },
  Cancelled,
}

impl TaskResult {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, Self::Pending { .. })
  }
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
  /// Task was queued and is now cancelled.
  Cancelled,
  /// Task is running; it stops at the next retry boundary.
  Requested,
  /// Task already finished with this status.
  AlreadyTerminal(TaskStatus),
}

/// Per-status counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
  pub queued: usize,
  pub running: usize,
  pub succeeded: usize,
  pub failed: usize,
  pub cancelled: usize,
}

struct TaskEntry {
  task: ComputationTask,
  status_tx: watch::Sender<TaskStatus>,
}

impl TaskEntry {
  fn new(task: ComputationTask) -> Self {
    let (status_tx, _) = watch::channel(task.status);
    Self { task, status_tx }
  }

  fn set_status(&mut self, status: TaskStatus) {
    self.task.status = status;
    if status == TaskStatus::Running && self.task.started_at.is_none() {
      self.task.started_at = Some(Utc::now());
    }
    if status.is_terminal() {
      self.task.completed_at = Some(Utc::now());
    }
    self.status_tx.send_replace(status);
  }
}

/// Whether a submission created a record or attached to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
  Inserted,
  Attached(TaskStatus),
}

#[derive(Default)]
pub(crate) struct TaskRegistry {
  tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskRegistry {
  /// Attach to an active record or replace any other record with a fresh queued one.
  pub fn admit(&self, id: &str, kind: ComputationKind) -> Admission {
    let mut tasks = self.tasks.lock();
    if let Some(entry) = tasks.get(id) {
      if entry.task.status.is_active() {
        return Admission::Attached(entry.task.status);
      }
    }
    tasks.insert(id.to_string(), TaskEntry::new(ComputationTask::new(id.to_string(), kind)));
    Admission::Inserted
  }

  /// Record a cache hit as a succeeded task unless a record is active.
  pub fn record_cached(&self, id: &str, kind: ComputationKind, result: Value) -> TaskStatus {
    let mut tasks = self.tasks.lock();
    if let Some(entry) = tasks.get_mut(id) {
      if entry.task.status.is_active() {
        return entry.task.status;
      }
      if entry.task.status == TaskStatus::Succeeded {
        entry.task.result = Some(result);
        return TaskStatus::Succeeded;
      }
    }
    let mut entry = TaskEntry::new(ComputationTask::new(id.to_string(), kind));
    entry.task.result = Some(result);
    entry.set_status(TaskStatus::Succeeded);
    tasks.insert(id.to_string(), entry);
    TaskStatus::Succeeded
  }

  /// `queued → running`; false when the record is missing or not queued.
  pub fn claim(&self, id: &str) -> bool {
    let mut tasks = self.tasks.lock();
    match tasks.get_mut(id) {
      Some(entry) if entry.task.status == TaskStatus::Queued => {
        entry.set_status(TaskStatus::Running);
        true
      }
      _ => false,
    }
  }

  pub fn record_attempt(&self, id: &str, attempt: u32) {
    if let Some(entry) = self.tasks.lock().get_mut(id) {
      entry.task.attempts = attempt;
    }
  }

  pub fn succeed(&self, id: &str, result: Value) {
    if let Some(entry) = self.tasks.lock().get_mut(id) {
      if entry.task.status == TaskStatus::Running {
        entry.task.result = Some(result);
        entry.set_status(TaskStatus::Succeeded);
      }
    }
  }

  pub fn fail(&self, id: &str, failure: TaskFailure) {
    if let Some(entry) = self.tasks.lock().get_mut(id) {
      if entry.task.status.is_active() {
        entry.task.failure = Some(failure);
        entry.set_status(TaskStatus::Failed);
      }
    }
  }

  /// Retry boundary: cancel a running task if a cancel was requested.
  pub fn cancel_at_boundary(&self, id: &str) -> bool {
    let mut tasks = self.tasks.lock();
    match tasks.get_mut(id) {
      Some(entry) if entry.task.status == TaskStatus::Running && entry.task.cancel_requested => {
        entry.set_status(TaskStatus::Cancelled);
        true
      }
      _ => false,
    }
  }

  pub fn cancel(&self, id: &str) -> Option<CancelOutcome> {
    let mut tasks = self.tasks.lock();
    let entry = tasks.get_mut(id)?;
    Some(match entry.task.status {
      TaskStatus::Queued => {
        entry.set_status(TaskStatus::Cancelled);
        CancelOutcome::Cancelled
      }
      TaskStatus::Running => {
        entry.task.cancel_requested = true;
        CancelOutcome::Requested
      }
      terminal => CancelOutcome::AlreadyTerminal(terminal),
    })
  }

  pub fn get(&self, id: &str) -> Option<ComputationTask> {
    self.tasks.lock().get(id).map(|e| e.task.clone())
  }

  pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<TaskStatus>> {
    self.tasks.lock().get(id).map(|e| e.status_tx.subscribe())
  }

  pub fn counts(&self) -> StatusCounts {
    let tasks = self.tasks.lock();
    let mut counts = StatusCounts::default();
    for entry in tasks.values() {
      match entry.task.status {
        TaskStatus::Queued => counts.queued += 1,
        TaskStatus::Running => counts.running += 1,
        TaskStatus::Succeeded => counts.succeeded += 1,
        TaskStatus::Failed => counts.failed += 1,
        TaskStatus::Cancelled => counts.cancelled += 1,
      }
    }
    counts
  }

  /// Drop terminal records completed before `cutoff`; returns how many were removed.
  pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
    let mut tasks = self.tasks.lock();
    let before = tasks.len();
    tasks.retain(|_, e| !(e.task.status.is_terminal() && e.task.completed_at.is_some_and(|t| t < cutoff)));
    before - tasks.len()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  const ID: &str = "abc";

  #[test]
  fn second_admission_attaches_while_active() {
    let registry = TaskRegistry::default();
    assert_eq!(registry.admit(ID, ComputationKind::VarCvar), Admission::Inserted);
    assert_eq!(
      registry.admit(ID, ComputationKind::VarCvar),
      Admission::Attached(TaskStatus::Queued)
    );
    assert!(registry.claim(ID));
    assert!(!registry.claim(ID));
    assert_eq!(
      registry.admit(ID, ComputationKind::VarCvar),
      Admission::Attached(TaskStatus::Running)
    );
  }

  #[test]
  fn failed_record_is_replaced_on_resubmission() {
    let registry = TaskRegistry::default();
    registry.admit(ID, ComputationKind::StressTest);
    registry.claim(ID);
    registry.fail(ID, TaskFailure::from(&ComputeError::numerical("singular")));

    let failed = registry.get(ID).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.failure.as_ref().unwrap().error_kind, ErrorKind::NumericalError);
    assert!(failed.completed_at.is_some());

    assert_eq!(registry.admit(ID, ComputationKind::StressTest), Admission::Inserted);
    let fresh = registry.get(ID).unwrap();
    assert_eq!(fresh.status, TaskStatus::Queued);
    assert!(fresh.failure.is_none());
  }

  #[test]
  fn cancel_semantics_depend_on_status() {
    let registry = TaskRegistry::default();
    registry.admit(ID, ComputationKind::VarCvar);
    assert_eq!(registry.cancel(ID), Some(CancelOutcome::Cancelled));
    assert!(!registry.claim(ID));

    registry.admit(ID, ComputationKind::VarCvar);
    registry.claim(ID);
    assert_eq!(registry.cancel(ID), Some(CancelOutcome::Requested));
    assert_eq!(registry.get(ID).unwrap().status, TaskStatus::Running);
    assert!(registry.cancel_at_boundary(ID));
    assert_eq!(
      registry.cancel(ID),
      Some(CancelOutcome::AlreadyTerminal(TaskStatus::Cancelled))
    );
    assert_eq!(registry.cancel("missing"), None);
  }

  #[test]
  fn outcome_reflects_status() {
    let registry = TaskRegistry::default();
    registry.admit(ID, ComputationKind::VarCvar);
    assert_eq!(
      registry.get(ID).unwrap().outcome(),
      TaskResult::Pending {
        status: TaskStatus::Queued
      }
    );
    registry.claim(ID);
    registry.succeed(ID, json!({"var": 0.019}));
    let task = registry.get(ID).unwrap();
    assert_eq!(task.outcome(), TaskResult::Succeeded { result: json!({"var": 0.019}) });
    assert!(task.started_at.is_some() && task.completed_at.is_some());
    assert_eq!(registry.counts().succeeded, 1);
  }

  #[test]
  fn watchers_see_terminal_status() {
    let registry = TaskRegistry::default();
    registry.admit(ID, ComputationKind::VarCvar);
    let rx = registry.subscribe(ID).unwrap();
    registry.claim(ID);
    registry.fail(ID, TaskFailure::from(&ComputeError::optimization("infeasible")));
    assert_eq!(*rx.borrow(), TaskStatus::Failed);
  }

  #[test]
  fn prune_drops_old_terminal_records_only() {
    let registry = TaskRegistry::default();
    registry.admit("done", ComputationKind::VarCvar);
    registry.cancel("done");
    registry.admit("waiting", ComputationKind::VarCvar);

    assert_eq!(registry.prune(Utc::now() + chrono::Duration::seconds(1)), 1);
    assert!(registry.get("done").is_none());
    assert!(registry.get("waiting").is_some());
  }
}
