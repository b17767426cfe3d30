//! Orchestrator configuration.
//!
//! Per-lane worker counts, timeouts and cache TTLs, the retry policy and the
//! maintenance sweep interval. Durations are (de)serialized as milliseconds.
//!
//! ```rust,ignore
//! let config = OrchestratorConfig::from_env()?;
//! let config = OrchestratorConfig::from_json_str(r#"{"risk": {"workers": 8}}"#)?;
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use super::params::Lane;
use crate::quant::returns::DEFAULT_WEIGHT_TOLERANCE;

/// Prefix of the environment overrides read by [`OrchestratorConfig::from_env`].
pub const ENV_PREFIX: &str = "PORTFOLIO_RISK_";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
  #[error("invalid configuration: {0}")]
  Invalid(String),

  #[error("failed to parse configuration: {0}")]
  Parse(String),

  #[error("invalid value '{value}' for {var}")]
  Env { var: String, value: String },
}

mod millis {
  use std::time::Duration;

  use serde::Deserialize;
  use serde::Deserializer;
  use serde::Serializer;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}

/// Worker pool settings of one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
  pub workers: usize,
  /// Budget for a single attempt.
  #[serde(with = "millis")]
  pub timeout: Duration,
  /// Lifetime of a cached result.
  #[serde(with = "millis")]
  pub cache_ttl: Duration,
}

impl Default for LaneConfig {
  fn default() -> Self {
    Self {
      workers: 2,
      timeout: Duration::from_secs(60),
      cache_ttl: Duration::from_secs(3600),
    }
  }
}

impl LaneConfig {
  pub fn new(workers: usize, timeout: Duration, cache_ttl: Duration) -> Self {
    Self {
      workers,
      timeout,
      cache_ttl,
    }
  }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub max_retries: u32,
  #[serde(with = "millis")]
  pub initial_backoff: Duration,
  #[serde(with = "millis")]
  pub max_backoff: Duration,
  pub multiplier: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_secs(10),
      multiplier: 2.0,
    }
  }
}

impl RetryPolicy {
  /// Doubling backoff starting at `initial_backoff`.
  pub fn exponential(max_retries: u32, initial_backoff: Duration) -> Self {
    Self {
      max_retries,
      initial_backoff,
      ..Default::default()
    }
  }

  /// No retries.
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Default::default()
    }
  }

  pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
    self.max_backoff = max_backoff;
    self
  }

  /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let factor = self.multiplier.powi(attempt.min(64) as i32);
    let secs = self.initial_backoff.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
      self.max_backoff
    } else {
      Duration::from_secs_f64(secs)
    }
  }
}

/// Top-level orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
  pub risk: LaneConfig,
  pub optimization: LaneConfig,
  pub reporting: LaneConfig,
  pub retry: RetryPolicy,
  /// Retries of a failed enqueue before the submission is rejected.
  pub enqueue_retries: u32,
  /// Period of the maintenance sweeper.
  #[serde(with = "millis")]
  pub sweep_interval: Duration,
  /// Terminal task records older than this are dropped by the sweeper.
  #[serde(with = "millis")]
  pub task_retention: Duration,
  pub weight_tolerance: f64,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      risk: LaneConfig::new(4, Duration::from_secs(60), Duration::from_secs(3600)),
      optimization: LaneConfig::new(2, Duration::from_secs(120), Duration::from_secs(3600)),
      reporting: LaneConfig::new(2, Duration::from_secs(60), Duration::from_secs(1800)),
      retry: RetryPolicy::default(),
      enqueue_retries: 3,
      sweep_interval: Duration::from_secs(60),
      task_retention: Duration::from_secs(24 * 3600),
      weight_tolerance: DEFAULT_WEIGHT_TOLERANCE,
    }
  }
}

impl OrchestratorConfig {
  /// Small pools, short timeouts and backoffs.
  pub fn development() -> Self {
    let lane = LaneConfig::new(1, Duration::from_secs(10), Duration::from_secs(300));
    Self {
      risk: lane.clone(),
      optimization: lane.clone(),
      reporting: lane,
      retry: RetryPolicy::exponential(2, Duration::from_millis(10)).max_backoff(Duration::from_millis(200)),
      enqueue_retries: 1,
      sweep_interval: Duration::from_secs(5),
      task_retention: Duration::from_secs(600),
      ..Default::default()
    }
  }

  /// Pools sized for a dedicated host.
  pub fn production() -> Self {
    let cpus = std::thread::available_parallelism().map_or(4, |n| n.get());
    Self {
      risk: LaneConfig::new(cpus.max(2), Duration::from_secs(120), Duration::from_secs(3600)),
      optimization: LaneConfig::new((cpus / 2).max(2), Duration::from_secs(300), Duration::from_secs(3600)),
      reporting: LaneConfig::new(2, Duration::from_secs(120), Duration::from_secs(1800)),
      retry: RetryPolicy::exponential(3, Duration::from_millis(250)).max_backoff(Duration::from_secs(30)),
      ..Default::default()
    }
  }

  /// Settings of a compute lane; `None` for the maintenance lane.
  pub fn lane(&self, lane: Lane) -> Option<&LaneConfig> {
    match lane {
      Lane::Risk => Some(&self.risk),
      Lane::Optimization => Some(&self.optimization),
      Lane::Reporting => Some(&self.reporting),
      Lane::Maintenance => None,
    }
  }

  fn lane_mut(&mut self, lane: Lane) -> Option<&mut LaneConfig> {
    match lane {
      Lane::Risk => Some(&mut self.risk),
      Lane::Optimization => Some(&mut self.optimization),
      Lane::Reporting => Some(&mut self.reporting),
      Lane::Maintenance => None,
    }
  }

  pub fn with_lane(mut self, lane: Lane, config: LaneConfig) -> Self {
    if let Some(slot) = self.lane_mut(lane) {
      *slot = config;
    }
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
    self.sweep_interval = interval;
    self
  }

  pub fn with_weight_tolerance(mut self, tolerance: f64) -> Self {
    self.weight_tolerance = tolerance;
    self
  }

  /// Parse a (possibly partial) JSON document; missing fields keep their defaults.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Preset from `PORTFOLIO_RISK_ENV` (`default()` when unset or unrecognized), then per-field overrides.
  ///
  /// Recognized overrides: `{LANE}_WORKERS`, `{LANE}_TIMEOUT_MS`, `{LANE}_CACHE_TTL_SECS`
  /// for `RISK`, `OPTIMIZATION`, `REPORTING`, plus `MAX_RETRIES`,
  /// `SWEEP_INTERVAL_SECS` and `WEIGHT_TOLERANCE`.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_vars(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
  }

  pub(crate) fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    let mut config = match get("ENV").as_deref() {
      Some("production" | "prod") => Self::production(),
      Some("development" | "dev") => Self::development(),
      _ => Self::default(),
    };

    for lane in Lane::COMPUTE {
      let upper = lane.as_str().to_uppercase();
      if let Some(workers) = parse_var::<usize>(&get, &format!("{upper}_WORKERS"))? {
        if let Some(slot) = config.lane_mut(lane) {
          slot.workers = workers;
        }
      }
      if let Some(ms) = parse_var::<u64>(&get, &format!("{upper}_TIMEOUT_MS"))? {
        if let Some(slot) = config.lane_mut(lane) {
          slot.timeout = Duration::from_millis(ms);
        }
      }
      if let Some(secs) = parse_var::<u64>(&get, &format!("{upper}_CACHE_TTL_SECS"))? {
        if let Some(slot) = config.lane_mut(lane) {
          slot.cache_ttl = Duration::from_secs(secs);
        }
      }
    }

    if let Some(n) = parse_var::<u32>(&get, "MAX_RETRIES")? {
      config.retry.max_retries = n;
    }
    if let Some(secs) = parse_var::<u64>(&get, "SWEEP_INTERVAL_SECS")? {
      config.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(tol) = parse_var::<f64>(&get, "WEIGHT_TOLERANCE")? {
      config.weight_tolerance = tol;
    }

    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    for lane in Lane::COMPUTE {
      if let Some(cfg) = self.lane(lane) {
        if cfg.workers == 0 {
          return Err(ConfigError::Invalid(format!("{lane} lane needs at least one worker")));
        }
        if cfg.timeout.is_zero() {
          return Err(ConfigError::Invalid(format!("{lane} lane timeout must be positive")));
        }
      }
    }
    if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
      return Err(ConfigError::Invalid(format!(
        "retry multiplier must be at least 1, got {}",
        self.retry.multiplier
      )));
    }
    if self.sweep_interval.is_zero() {
      return Err(ConfigError::Invalid("sweep interval must be positive".into()));
    }
    if !(self.weight_tolerance.is_finite() && self.weight_tolerance > 0.0) {
      return Err(ConfigError::Invalid(format!(
        "weight tolerance must be positive, got {}",
        self.weight_tolerance
      )));
    }
    Ok(())
  }
}

fn parse_var<T: std::str::FromStr>(
  get: &impl Fn(&str) -> Option<String>,
  name: &str,
) -> Result<Option<T>, ConfigError> {
  match get(name) {
    None => Ok(None),
    Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::Env {
      var: format!("{ENV_PREFIX}{name}"),
      value,
    }),
  }
}
