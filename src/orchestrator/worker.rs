//! Lane workers and the maintenance sweeper.

use std::any::Any;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::broker::Job;
use super::broker::TaskBroker;
use super::config::OrchestratorConfig;
use super::executor::ComputationExecutor;
use super::params::Lane;
use super::task::TaskFailure;
use super::task::TaskRegistry;
use crate::error::ComputeError;
use crate::error::Result;

/// Monotonic orchestrator counters.
#[derive(Default)]
pub(crate) struct Counters {
  pub submitted: AtomicU64,
  pub dispatched: AtomicU64,
  pub attached: AtomicU64,
  pub cache_hits: AtomicU64,
  pub retries: AtomicU64,
  pub duplicates_dropped: AtomicU64,
  pub succeeded: AtomicU64,
  pub failed: AtomicU64,
  pub cancelled: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
  pub submitted: u64,
  /// Executions started by a worker; one per claimed task.
  pub dispatched: u64,
  pub attached: u64,
  pub cache_hits: u64,
  pub retries: u64,
  pub duplicates_dropped: u64,
  pub succeeded: u64,
  pub failed: u64,
  pub cancelled: u64,
}

impl Counters {
  pub fn snapshot(&self) -> CounterSnapshot {
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    CounterSnapshot {
      submitted: load(&self.submitted),
      dispatched: load(&self.dispatched),
      attached: load(&self.attached),
      cache_hits: load(&self.cache_hits),
      retries: load(&self.retries),
      duplicates_dropped: load(&self.duplicates_dropped),
      succeeded: load(&self.succeeded),
      failed: load(&self.failed),
      cancelled: load(&self.cancelled),
    }
  }

  pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }
}

/// State shared by the front door and every worker.
pub(crate) struct Shared {
  pub config: OrchestratorConfig,
  pub broker: Arc<dyn TaskBroker>,
  pub executor: Arc<dyn ComputationExecutor>,
  pub registry: TaskRegistry,
  pub counters: Counters,
}

/// Pull jobs from `lane` until the broker closes.
pub(crate) async fn run_lane_worker(shared: Arc<Shared>, lane: Lane, worker: usize) {
  debug!(%lane, worker, "worker started");
  while let Some(job) = shared.broker.dequeue(lane).await {
    process_job(&shared, &job).await;
    if let Err(err) = shared.broker.ack(&job).await {
      warn!(task_id = %job.task_id, error = %err, "failed to ack job");
    }
  }
  debug!(%lane, worker, "worker stopped");
}

#[instrument(skip_all, fields(task_id = %job.task_id, lane = %job.lane))]
async fn process_job(shared: &Shared, job: &Job) {
  if !shared.registry.claim(&job.task_id) {
    Counters::bump(&shared.counters.duplicates_dropped);
    debug!("task no longer queued, dropping job");
    return;
  }
  Counters::bump(&shared.counters.dispatched);

  let Some(lane_cfg) = shared.config.lane(job.lane) else {
    let err = ComputeError::Internal(format!("no worker configuration for lane {}", job.lane));
    shared.registry.fail(&job.task_id, TaskFailure::from(&err));
    Counters::bump(&shared.counters.failed);
    return;
  };
  let retry = &shared.config.retry;

  let mut attempt: u32 = 0;
  loop {
    attempt += 1;
    shared.registry.record_attempt(&job.task_id, attempt);

    match run_attempt(shared, job, lane_cfg.timeout).await {
      Ok(value) => {
        if let Err(err) = shared.broker.cache_set(&job.task_id, value.clone(), lane_cfg.cache_ttl).await {
          warn!(error = %err, "result not cached");
        }
        shared.registry.succeed(&job.task_id, value);
        Counters::bump(&shared.counters.succeeded);
        info!(attempt, "computation succeeded");
        return;
      }
      Err(err) if err.is_transient() && attempt <= retry.max_retries => {
        if shared.registry.cancel_at_boundary(&job.task_id) {
          Counters::bump(&shared.counters.cancelled);
          info!(attempt, "cancelled at retry boundary");
          return;
        }
        let delay = retry.delay_for_attempt(attempt - 1);
        Counters::bump(&shared.counters.retries);
        warn!(attempt, error_kind = %err.kind(), error = %err, ?delay, "attempt failed, retrying");
        tokio::time::sleep(delay).await;
        if shared.registry.cancel_at_boundary(&job.task_id) {
          Counters::bump(&shared.counters.cancelled);
          info!(attempt, "cancelled at retry boundary");
          return;
        }
      }
      Err(err) => {
        error!(attempt, error_kind = %err.kind(), error = %err, "computation failed");
        shared.registry.fail(&job.task_id, TaskFailure::from(&err));
        Counters::bump(&shared.counters.failed);
        return;
      }
    }
  }
}

/// One execution on a blocking thread, bounded by `timeout`.
///
/// A blocking call cannot be interrupted, so a timed-out attempt is still
/// joined before this returns. The worker never has more than one execution
/// in flight and a retry never overlaps the attempt it replaces.
async fn run_attempt(shared: &Shared, job: &Job, timeout: Duration) -> Result<Value> {
  let executor = shared.executor.clone();
  let params = job.params.clone();
  let mut handle = tokio::task::spawn_blocking(move || executor.execute(&params));

  let joined = match tokio::time::timeout(timeout, &mut handle).await {
    Ok(joined) => joined,
    Err(_) => {
      warn!(?timeout, "attempt timed out, waiting for the abandoned execution to return");
      if let Err(join_err) = handle.await {
        warn!(error = %join_err, "abandoned execution ended abnormally");
      }
      return Err(ComputeError::Timeout(timeout));
    }
  };

  match joined {
    Err(join_err) if join_err.is_panic() => Err(ComputeError::Internal(format!(
      "computation panicked: {}",
      panic_message(join_err.into_panic())
    ))),
    Err(join_err) => Err(ComputeError::Internal(format!("computation aborted: {join_err}"))),
    Ok(result) => result,
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

/// Periodically purge expired cache entries and old terminal task records.
pub(crate) async fn run_sweeper(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
  let mut ticker = tokio::time::interval(shared.config.sweep_interval);
  ticker.tick().await;
  loop {
    tokio::select! {
      _ = ticker.tick() => sweep(&shared).await,
      changed = shutdown.changed() => {
        if changed.is_err() || *shutdown.borrow() {
          break;
        }
      }
    }
  }
  debug!(lane = %Lane::Maintenance, "sweeper stopped");
}

pub(crate) async fn sweep(shared: &Shared) {
  match shared.broker.purge_expired().await {
    Ok(purged) if purged > 0 => debug!(lane = %Lane::Maintenance, purged, "cache swept"),
    Ok(_) => {}
    Err(err) => warn!(lane = %Lane::Maintenance, error = %err, "cache sweep failed"),
  }

  let retention = chrono::Duration::from_std(shared.config.task_retention).unwrap_or(chrono::Duration::MAX);
  if let Some(cutoff) = chrono::Utc::now().checked_sub_signed(retention) {
    let pruned = shared.registry.prune(cutoff);
    if pruned > 0 {
      debug!(lane = %Lane::Maintenance, pruned, "old task records dropped");
    }
  }
}
