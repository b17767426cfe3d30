//! Queue and result cache.
//!
//! [`TaskBroker`] is the seam to external infrastructure; [`InMemoryBroker`]
//! keeps one FIFO per lane and a TTL cache keyed by fingerprint.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::params::ComputationParams;
use super::params::Lane;
use crate::error::ComputeError;
use crate::error::Result;

/// Unit of work placed on a lane queue.
#[derive(Debug, Clone)]
pub struct Job {
  pub task_id: String,
  pub lane: Lane,
  pub params: Arc<ComputationParams>,
  pub enqueued_at: DateTime<Utc>,
}

impl Job {
  pub fn new(task_id: String, params: Arc<ComputationParams>) -> Self {
    Self {
      task_id,
      lane: params.lane(),
      params,
      enqueued_at: Utc::now(),
    }
  }
}

/// Queue and cache operations the orchestrator depends on.
///
/// Errors should be [`ComputeError::TransientInfrastructure`] when a retry may help.
#[async_trait]
pub trait TaskBroker: Send + Sync {
  async fn enqueue(&self, job: Job) -> Result<()>;

  /// Next job of `lane`; waits until one arrives. `None` once the broker is closed.
  async fn dequeue(&self, lane: Lane) -> Option<Job>;

  /// Acknowledge that a dequeued job has been handled.
  async fn ack(&self, job: &Job) -> Result<()>;

  async fn cache_get(&self, fingerprint: &str) -> Result<Option<Value>>;

  async fn cache_set(&self, fingerprint: &str, value: Value, ttl: Duration) -> Result<()>;

  /// Remove a cached result; true when an entry existed.
  async fn cache_invalidate(&self, fingerprint: &str) -> Result<bool>;

  /// Drop expired cache entries; returns how many were removed.
  async fn purge_expired(&self) -> Result<usize>;

  /// Stop handing out jobs and wake every waiting consumer.
  async fn close(&self);
}

struct CacheEntry {
  value: Value,
  expires_at: Instant,
}

/// Process-local broker.
pub struct InMemoryBroker {
  queues: Mutex<HashMap<Lane, VecDeque<Job>>>,
  signals: [Notify; 4],
  in_flight: Mutex<HashSet<String>>,
  cache: Mutex<HashMap<String, CacheEntry>>,
  closed: AtomicBool,
}

impl Default for InMemoryBroker {
  fn default() -> Self {
    Self {
      queues: Mutex::new(HashMap::new()),
      signals: std::array::from_fn(|_| Notify::new()),
      in_flight: Mutex::new(HashSet::new()),
      cache: Mutex::new(HashMap::new()),
      closed: AtomicBool::new(false),
    }
  }
}

impl InMemoryBroker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Jobs waiting in `lane`.
  pub fn queue_len(&self, lane: Lane) -> usize {
    self.queues.lock().get(&lane).map_or(0, VecDeque::len)
  }

  /// Jobs dequeued but not yet acknowledged.
  pub fn in_flight(&self) -> usize {
    self.in_flight.lock().len()
  }

  pub fn cache_len(&self) -> usize {
    self.cache.lock().len()
  }

  fn pop(&self, lane: Lane) -> Option<Job> {
    let job = self.queues.lock().get_mut(&lane)?.pop_front()?;
    self.in_flight.lock().insert(job.task_id.clone());
    Some(job)
  }
}

#[async_trait]
impl TaskBroker for InMemoryBroker {
  async fn enqueue(&self, job: Job) -> Result<()> {
    if self.closed.load(Ordering::Acquire) {
      return Err(ComputeError::TransientInfrastructure("broker is closed".into()));
    }
    let lane = job.lane;
    self.queues.lock().entry(lane).or_default().push_back(job);
    self.signals[lane.index()].notify_one();
    Ok(())
  }

  async fn dequeue(&self, lane: Lane) -> Option<Job> {
    let signal = &self.signals[lane.index()];
    loop {
      let notified = signal.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(job) = self.pop(lane) {
        return Some(job);
      }
      if self.closed.load(Ordering::Acquire) {
        return None;
      }
      notified.await;
    }
  }

  async fn ack(&self, job: &Job) -> Result<()> {
    self.in_flight.lock().remove(&job.task_id);
    Ok(())
  }

  async fn cache_get(&self, fingerprint: &str) -> Result<Option<Value>> {
    let mut cache = self.cache.lock();
    match cache.get(fingerprint) {
      Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
      Some(_) => {
        cache.remove(fingerprint);
        Ok(None)
      }
      None => Ok(None),
    }
  }

  async fn cache_set(&self, fingerprint: &str, value: Value, ttl: Duration) -> Result<()> {
    let expires_at = Instant::now() + ttl;
    self
      .cache
      .lock()
      .insert(fingerprint.to_string(), CacheEntry { value, expires_at });
    Ok(())
  }

  async fn cache_invalidate(&self, fingerprint: &str) -> Result<bool> {
    Ok(self.cache.lock().remove(fingerprint).is_some())
  }

  async fn purge_expired(&self) -> Result<usize> {
    let now = Instant::now();
    let mut cache = self.cache.lock();
    let before = cache.len();
    cache.retain(|_, entry| entry.expires_at > now);
    let purged = before - cache.len();
    if purged > 0 {
      debug!(purged, "expired cache entries removed");
    }
    Ok(purged)
  }

  async fn close(&self) {
    self.closed.store(true, Ordering::Release);
    for signal in &self.signals {
      signal.notify_waiters();
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::orchestrator::params::RebalanceParams;

  fn job(id: &str) -> Job {
    let params = ComputationParams::RebalancePortfolio(RebalanceParams {
      current_weights: vec![0.5, 0.5],
      target_weights: vec![0.6, 0.4],
      threshold: 0.05,
      asset_ids: None,
      portfolio_value: None,
    });
    Job::new(id.to_string(), Arc::new(params))
  }

  #[tokio::test]
  async fn lanes_are_fifo_and_independent() {
    let broker = InMemoryBroker::new();
    broker.enqueue(job("a")).await.unwrap();
    broker.enqueue(job("b")).await.unwrap();

    assert_eq!(broker.queue_len(Lane::Optimization), 2);
    assert_eq!(broker.queue_len(Lane::Risk), 0);
    assert_eq!(broker.dequeue(Lane::Optimization).await.unwrap().task_id, "a");
    let second = broker.dequeue(Lane::Optimization).await.unwrap();
    assert_eq!(second.task_id, "b");
    assert_eq!(broker.in_flight(), 2);
    broker.ack(&second).await.unwrap();
    assert_eq!(broker.in_flight(), 1);
  }

  #[tokio::test]
  async fn waiting_consumer_is_woken_by_enqueue_and_close() {
    let broker = Arc::new(InMemoryBroker::new());

    let consumer = tokio::spawn({
      let broker = broker.clone();
      async move { broker.dequeue(Lane::Optimization).await.map(|j| j.task_id) }
    });
    tokio::task::yield_now().await;
    broker.enqueue(job("late")).await.unwrap();
    assert_eq!(consumer.await.unwrap().as_deref(), Some("late"));

    let idle = tokio::spawn({
      let broker = broker.clone();
      async move { broker.dequeue(Lane::Risk).await }
    });
    tokio::task::yield_now().await;
    broker.close().await;
    assert!(idle.await.unwrap().is_none());
    assert!(broker.enqueue(job("after")).await.is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn cache_entries_expire() {
    let broker = InMemoryBroker::new();
    broker.cache_set("fp", json!(1), Duration::from_secs(10)).await.unwrap();
    broker.cache_set("other", json!(2), Duration::from_secs(100)).await.unwrap();
    assert_eq!(broker.cache_get("fp").await.unwrap(), Some(json!(1)));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(broker.cache_len(), 2);
    assert_eq!(broker.purge_expired().await.unwrap(), 1);
    assert_eq!(broker.cache_get("fp").await.unwrap(), None);
    assert!(broker.cache_invalidate("other").await.unwrap());
    assert!(!broker.cache_invalidate("other").await.unwrap());
  }

  #[test]
  fn cache_round_trip_without_runtime() {
    let broker = InMemoryBroker::new();
    tokio_test::block_on(broker.cache_set("fp", json!({"x": 1}), Duration::from_secs(60))).unwrap();
    let hit = tokio_test::block_on(broker.cache_get("fp")).unwrap();
    assert_eq!(hit, Some(json!({"x": 1})));
    assert_eq!(broker.cache_len(), 1);
  }
}
