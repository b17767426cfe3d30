//! # Task Orchestrator
//!
//! Asynchronous front door over the calculators. A submission is parsed into
//! typed [`ComputationParams`], fingerprinted, and either attached to an
//! active task with the same fingerprint, answered from the result cache, or
//! queued on its lane. Lane workers run each computation on a blocking thread
//! under the lane timeout, retry transient failures with exponential backoff
//! and publish the outcome to waiters.
//!
//! | Lane           | Computations                                                  |
//! |----------------|---------------------------------------------------------------|
//! | `risk`         | `var_cvar`, `monte_carlo_simulation`, `stress_test`           |
//! | `optimization` | `optimize_portfolio`, `efficient_frontier`, `rebalance_portfolio` |
//! | `reporting`    | `performance_analysis`                                        |
//! | `maintenance`  | cache sweeping                                                |
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::start(OrchestratorConfig::development())?;
//! let handle = orchestrator.submit("var_cvar", params).await?;
//! let outcome = orchestrator.wait(&handle.task_id, Duration::from_secs(5)).await?;
//! ```

pub mod broker;
pub mod config;
pub mod executor;
pub mod fingerprint;
pub mod params;
pub mod task;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

pub use broker::InMemoryBroker;
pub use broker::Job;
pub use broker::TaskBroker;
pub use config::ConfigError;
pub use config::LaneConfig;
pub use config::OrchestratorConfig;
pub use config::RetryPolicy;
pub use executor::ComputationExecutor;
pub use executor::EngineExecutor;
pub use params::ComputationKind;
pub use params::ComputationParams;
pub use params::Lane;
pub use task::CancelOutcome;
pub use task::ComputationTask;
pub use task::StatusCounts;
pub use task::TaskFailure;
pub use task::TaskResult;
pub use task::TaskStatus;
pub use task::TaskStatusView;
pub use worker::CounterSnapshot;

use self::task::Admission;
use self::task::TaskRegistry;
use self::worker::Counters;
use self::worker::Shared;
use crate::error::ComputeError;
use crate::error::Result;

/// Handle returned by a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
  pub task_id: String,
  /// `queued` for a new task, `succeeded` on a cache hit, otherwise the attached task's status.
  pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
  pub counters: CounterSnapshot,
  pub tasks: StatusCounts,
}

pub struct Orchestrator {
  shared: Arc<Shared>,
  workers: Mutex<Vec<JoinHandle<()>>>,
  shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
  /// In-memory broker and the built-in calculators. Must be called inside a Tokio runtime.
  pub fn start(config: OrchestratorConfig) -> Result<Self> {
    let executor = EngineExecutor::new(config.weight_tolerance);
    Self::with_components(config, Arc::new(InMemoryBroker::new()), Arc::new(executor))
  }

  pub fn with_components(
    config: OrchestratorConfig,
    broker: Arc<dyn TaskBroker>,
    executor: Arc<dyn ComputationExecutor>,
  ) -> Result<Self> {
    config
      .validate()
      .map_err(|err| ComputeError::validation(err.to_string()))?;
    let runtime = tokio::runtime::Handle::try_current()
      .map_err(|err| ComputeError::Internal(format!("orchestrator needs a Tokio runtime: {err}")))?;

    let shared = Arc::new(Shared {
      config,
      broker,
      executor,
      registry: TaskRegistry::default(),
      counters: Counters::default(),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    for lane in Lane::COMPUTE {
      let count = shared.config.lane(lane).map_or(0, |cfg| cfg.workers);
      for id in 0..count {
        workers.push(runtime.spawn(worker::run_lane_worker(shared.clone(), lane, id)));
      }
    }
    workers.push(runtime.spawn(worker::run_sweeper(shared.clone(), shutdown_rx)));
    info!(
      risk = shared.config.risk.workers,
      optimization = shared.config.optimization.workers,
      reporting = shared.config.reporting.workers,
      "orchestrator started"
    );

    Ok(Self {
      shared,
      workers: Mutex::new(workers),
      shutdown_tx,
    })
  }

  pub fn config(&self) -> &OrchestratorConfig {
    &self.shared.config
  }

  /// Submit `{computation_name, parameters}`; invalid requests are rejected before anything is queued.
  #[instrument(skip(self, parameters))]
  pub async fn submit(&self, computation_name: &str, parameters: Value) -> Result<Submission> {
    let params = ComputationParams::from_submission(computation_name, parameters)?;
    self.submit_params(params).await
  }

  #[instrument(skip_all, fields(computation = %params.kind(), task_id = tracing::field::Empty))]
  pub async fn submit_params(&self, params: ComputationParams) -> Result<Submission> {
    params.validate(self.shared.config.weight_tolerance)?;
    let task_id = fingerprint::fingerprint(&params)?;
    tracing::Span::current().record("task_id", task_id.as_str());
    let kind = params.kind();
    Counters::bump(&self.shared.counters.submitted);

    if let Some(task) = self.shared.registry.get(&task_id) {
      if task.status.is_active() {
        return Ok(self.attached(task_id, task.status));
      }
    }

    match self.shared.broker.cache_get(&task_id).await {
      Ok(Some(cached)) => {
        let status = self.shared.registry.record_cached(&task_id, kind, cached);
        if status.is_active() {
          return Ok(self.attached(task_id, status));
        }
        Counters::bump(&self.shared.counters.cache_hits);
        info!("served from cache");
        return Ok(Submission { task_id, status });
      }
      Ok(None) => {}
      Err(err) => warn!(error = %err, "cache lookup failed, computing"),
    }

    if let Admission::Attached(status) = self.shared.registry.admit(&task_id, kind) {
      return Ok(self.attached(task_id, status));
    }
    self.enqueue(Job::new(task_id.clone(), Arc::new(params))).await?;
    debug!("task queued");
    Ok(Submission {
      task_id,
      status: TaskStatus::Queued,
    })
  }

  fn attached(&self, task_id: String, status: TaskStatus) -> Submission {
    Counters::bump(&self.shared.counters.attached);
    info!(%status, "attached to active task");
    Submission { task_id, status }
  }

  async fn enqueue(&self, job: Job) -> Result<()> {
    let retry = &self.shared.config.retry;
    let mut attempt = 0;
    loop {
      match self.shared.broker.enqueue(job.clone()).await {
        Ok(()) => return Ok(()),
        Err(err) if err.is_transient() && attempt < self.shared.config.enqueue_retries => {
          let delay = retry.delay_for_attempt(attempt);
          attempt += 1;
          warn!(attempt, error = %err, ?delay, "enqueue failed, retrying");
          tokio::time::sleep(delay).await;
        }
        Err(err) => {
          warn!(error_kind = %err.kind(), error = %err, "enqueue failed, rejecting submission");
          self.shared.registry.fail(&job.task_id, TaskFailure::from(&err));
          return Err(err);
        }
      }
    }
  }

  pub fn status(&self, task_id: &str) -> Option<TaskStatusView> {
    self.shared.registry.get(task_id).map(|task| task.status_view())
  }

  pub fn result(&self, task_id: &str) -> Option<TaskResult> {
    self.shared.registry.get(task_id).map(|task| task.outcome())
  }

  /// Full task record.
  pub fn task(&self, task_id: &str) -> Option<ComputationTask> {
    self.shared.registry.get(task_id)
  }

  /// Wait until the task reaches a terminal state.
  ///
  /// Unknown ids, and records pruned or replaced before their outcome could be
  /// read, are a validation error. Running out of `timeout` is a
  /// [`ComputeError::Timeout`] and leaves the task untouched.
  pub async fn wait(&self, task_id: &str, timeout: Duration) -> Result<TaskResult> {
    let mut rx = self
      .shared
      .registry
      .subscribe(task_id)
      .ok_or_else(|| ComputeError::validation(format!("unknown task '{task_id}'")))?;

    let waited = tokio::time::timeout(timeout, rx.wait_for(|status| status.is_terminal()))
      .await
      .map(|changed| changed.is_ok());
    if waited.is_err() {
      return Err(ComputeError::Timeout(timeout));
    }
    // The record may have been pruned, or replaced by a resubmission, since the subscription.
    match self.result(task_id) {
      Some(outcome) if outcome.is_terminal() => Ok(outcome),
      _ => Err(ComputeError::validation(format!(
        "task '{task_id}' was replaced or expired before its outcome was read"
      ))),
    }
  }

  /// Queued tasks are cancelled at once; running ones stop at their next retry boundary.
  #[instrument(skip(self))]
  pub fn cancel(&self, task_id: &str) -> Option<CancelOutcome> {
    let outcome = self.shared.registry.cancel(task_id)?;
    info!(?outcome, "cancel requested");
    Some(outcome)
  }

  /// Drop the cached result of `task_id`; true when an entry existed.
  pub async fn invalidate(&self, task_id: &str) -> Result<bool> {
    self.shared.broker.cache_invalidate(task_id).await
  }

  pub fn stats(&self) -> OrchestratorStats {
    OrchestratorStats {
      counters: self.shared.counters.snapshot(),
      tasks: self.shared.registry.counts(),
    }
  }

  /// Close the broker and wait for every worker to finish its current job.
  pub async fn shutdown(self) {
    self.shared.broker.close().await;
    self.shutdown_tx.send_replace(true);
    let workers = std::mem::take(&mut *self.workers.lock());
    for handle in workers {
      if let Err(err) = handle.await {
        warn!(error = %err, "worker ended abnormally");
      }
    }
    info!("orchestrator stopped");
  }
}

impl Drop for Orchestrator {
  fn drop(&mut self) {
    self.shutdown_tx.send_replace(true);
    for handle in self.workers.lock().drain(..) {
      handle.abort();
    }
  }
}
