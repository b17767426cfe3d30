//! # Risk Metrics
//!
//! $$
//! \operatorname{VaR}_c(h),\ \operatorname{CVaR}_c(h),\ \sigma\sqrt{k},\ S,\ \mathrm{MDD},\ \beta,\ \alpha
//! $$
//!
//! Portfolio risk assessment under historical, parametric and Monte Carlo VaR.

pub mod metrics;
pub mod var;

use nalgebra::DVector;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::ComputeError;
use crate::error::Result;
use crate::quant::linalg;
use crate::quant::monte_carlo::MonteCarloEngine;
use crate::quant::returns::validate_weights;
use crate::quant::returns::ReturnSeries;
use crate::quant::returns::DEFAULT_WEIGHT_TOLERANCE;
use crate::quant::PERIODS_PER_YEAR;

pub use metrics::PerformanceReport;
pub use var::TailEstimate;

/// VaR methodology.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarMethod {
  #[default]
  Historical,
  Parametric,
  MonteCarlo,
}

impl std::fmt::Display for VarMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      VarMethod::Historical => write!(f, "historical"),
      VarMethod::Parametric => write!(f, "parametric"),
      VarMethod::MonteCarlo => write!(f, "monte_carlo"),
    }
  }
}

/// Runtime configuration for [`RiskCalculator`].
#[derive(Clone, Debug)]
pub struct RiskConfig {
  /// Confidence level in `(0, 1)`.
  pub confidence: f64,
  /// Horizon in periods.
  pub horizon: i64,
  pub method: VarMethod,
  /// Annual risk-free rate used by the Sharpe ratio.
  pub risk_free_rate: f64,
  pub periods_per_year: f64,
  /// Paths for Monte Carlo VaR.
  pub num_simulations: usize,
  pub seed: Option<u64>,
  /// Tolerance on the weight sum.
  pub weight_tolerance: f64,
}

impl Default for RiskConfig {
  fn default() -> Self {
    Self {
      confidence: 0.95,
      horizon: 1,
      method: VarMethod::Historical,
      risk_free_rate: 0.0,
      periods_per_year: PERIODS_PER_YEAR,
      num_simulations: 10_000,
      seed: None,
      weight_tolerance: DEFAULT_WEIGHT_TOLERANCE,
    }
  }
}

/// Outcome of a risk computation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RiskAssessment {
  pub method: VarMethod,
  pub confidence: f64,
  pub horizon: usize,
  /// Positive loss fraction.
  pub var: f64,
  /// Positive loss fraction, at least as extreme as `var`.
  pub cvar: f64,
  /// Annualized volatility of the portfolio series.
  pub volatility: f64,
  /// Mean per-period portfolio return.
  pub mean_return: f64,
  pub sharpe_ratio: f64,
  pub max_drawdown: f64,
  pub beta: Option<f64>,
  pub alpha: Option<f64>,
}

/// VaR/CVaR and companion statistics for a weighted portfolio.
#[derive(Clone, Debug, Default)]
pub struct RiskCalculator {
  config: RiskConfig,
}

impl RiskCalculator {
  pub fn new(config: RiskConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &RiskConfig {
    &self.config
  }

  /// Assess `series` weighted by `weights`, optionally against a benchmark series.
  pub fn assess(
    &self,
    series: &ReturnSeries,
    weights: &[f64],
    benchmark: Option<&[f64]>,
  ) -> Result<RiskAssessment> {
    let cfg = &self.config;
    var::check_confidence(cfg.confidence)?;
    let horizon = var::check_horizon(cfg.horizon)?;
    validate_weights(weights, cfg.weight_tolerance)?;

    let port = series.portfolio_returns(weights)?.to_vec();
    let std = metrics::sample_std(&port)?;
    let mean = metrics::sample_mean(&port);

    let tail = match cfg.method {
      VarMethod::Historical => var::historical_var(&port, cfg.confidence, horizon)?,
      VarMethod::Parametric => var::parametric_var(mean, std, cfg.confidence, horizon)?,
      VarMethod::MonteCarlo => self.monte_carlo_tail(series, weights, horizon)?,
    };

    let sharpe_ratio = metrics::sharpe_ratio(&port, cfg.risk_free_rate, cfg.periods_per_year)?;
    let (beta, alpha) = match benchmark {
      Some(bench) => {
        let (beta, alpha) = metrics::beta_alpha(&port, bench)?;
        (Some(beta), Some(alpha))
      }
      None => (None, None),
    };

    debug!(
      method = %cfg.method,
      var = tail.var,
      cvar = tail.cvar,
      "risk assessment computed"
    );

    Ok(RiskAssessment {
      method: cfg.method,
      confidence: cfg.confidence,
      horizon,
      var: tail.var,
      cvar: tail.cvar,
      volatility: std * cfg.periods_per_year.sqrt(),
      mean_return: mean,
      sharpe_ratio,
      max_drawdown: metrics::max_drawdown(&port),
      beta,
      alpha,
    })
  }

  fn monte_carlo_tail(
    &self,
    series: &ReturnSeries,
    weights: &[f64],
    horizon: usize,
  ) -> Result<TailEstimate> {
    if self.config.num_simulations == 0 {
      return Err(ComputeError::validation("num_simulations must be positive"));
    }

    let cov = linalg::from_array(&series.covariance()?)?;
    let mean = DVector::from_iterator(series.n_assets(), series.mean_returns());

    let engine = MonteCarloEngine::from_moments(
      &mean,
      &cov,
      weights,
      self.config.num_simulations,
      horizon,
      self.config.seed,
      None,
    )?;
    let simulated: Vec<f64> = engine
      .terminal_values_par()
      .into_iter()
      .map(|v| v / engine.initial_value() - 1.0)
      .collect();

    var::empirical_tail(&simulated, self.config.confidence)
  }
}
