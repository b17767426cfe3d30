//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\min_{\mathbf{w}} \mathbf{w}^\top\Sigma\mathbf{w}
//! \quad\text{s.t.}\quad \mathbf{1}^\top\mathbf{w}=1,\ l\le\mathbf{w}\le u,\ \mu^\top\mathbf{w}=r^\*
//! $$
//!
//! Shared enums, constraint sets and result containers for portfolio optimization.

use std::str::FromStr;

use nalgebra::DMatrix;
use nalgebra::DVector;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ComputeError;
use crate::error::Result;
use crate::quant::linalg;
use crate::quant::returns::default_asset_ids;
use crate::quant::returns::Portfolio;
use crate::quant::returns::DEFAULT_WEIGHT_TOLERANCE;

/// Supported allocation objectives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
  /// Minimum variance, optionally at a target return or volatility.
  #[default]
  MeanVariance,
  /// Equalized risk contributions.
  RiskParity,
  /// Tangency portfolio on the efficient frontier.
  MaxSharpe,
}

impl FromStr for OptimizationMode {
  type Err = ComputeError;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "mean_variance" | "mean-variance" | "markowitz" => Ok(Self::MeanVariance),
      "risk_parity" | "risk-parity" | "riskparity" => Ok(Self::RiskParity),
      "max_sharpe" | "max-sharpe" | "tangency" => Ok(Self::MaxSharpe),
      other => Err(ComputeError::validation(format!(
        "unknown optimization mode '{other}'"
      ))),
    }
  }
}

/// Constraint set applied to an optimization.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizationConstraints {
  /// Per-asset `(min, max)` weight.
  pub bounds: Vec<(f64, f64)>,
  pub target_return: Option<f64>,
  pub target_volatility: Option<f64>,
}

impl OptimizationConstraints {
  /// `[0, 1]` bounds for every asset, no targets.
  pub fn long_only(n: usize) -> Self {
    Self {
      bounds: vec![(0.0, 1.0); n],
      target_return: None,
      target_volatility: None,
    }
  }

  pub fn with_bounds(mut self, bounds: Vec<(f64, f64)>) -> Self {
    self.bounds = bounds;
    self
  }

  pub fn with_target_return(mut self, target: f64) -> Self {
    self.target_return = Some(target);
    self
  }

  pub fn with_target_volatility(mut self, target: f64) -> Self {
    self.target_volatility = Some(target);
    self
  }
}

/// Validated optimizer inputs.
#[derive(Clone, Debug)]
pub struct AllocationProblem {
  pub(crate) mu: DVector<f64>,
  pub(crate) cov: DMatrix<f64>,
  pub(crate) lower: Vec<f64>,
  pub(crate) upper: Vec<f64>,
  pub(crate) asset_ids: Vec<String>,
  pub(crate) risk_free_rate: f64,
}

impl AllocationProblem {
  /// Validate expected returns, covariance and bounds (default `[0, 1]`).
  pub fn new(
    mean_returns: &[f64],
    covariance: &[Vec<f64>],
    bounds: Option<&[(f64, f64)]>,
    asset_ids: Option<Vec<String>>,
    risk_free_rate: f64,
  ) -> Result<Self> {
    let n = mean_returns.len();
    if n == 0 {
      return Err(ComputeError::validation("expected return vector is empty"));
    }
    if mean_returns.iter().any(|m| !m.is_finite()) {
      return Err(ComputeError::validation("expected returns must be finite"));
    }
    if !risk_free_rate.is_finite() {
      return Err(ComputeError::validation("risk-free rate must be finite"));
    }
    let cov = linalg::covariance_matrix(covariance, n)?;

    let bounds = bounds.map(<[_]>::to_vec).unwrap_or_else(|| vec![(0.0, 1.0); n]);
    if bounds.len() != n {
      return Err(ComputeError::validation(format!(
        "{} bounds supplied for {n} assets",
        bounds.len()
      )));
    }
    for (i, &(lo, hi)) in bounds.iter().enumerate() {
      if !(lo.is_finite() && hi.is_finite() && 0.0 <= lo && lo <= hi && hi <= 1.0) {
        return Err(ComputeError::validation(format!(
          "bounds for asset {i} must satisfy 0 <= min <= max <= 1, got ({lo}, {hi})"
        )));
      }
    }

    let asset_ids = asset_ids.unwrap_or_else(|| default_asset_ids(n));
    if asset_ids.len() != n {
      return Err(ComputeError::validation(format!(
        "{} asset ids supplied for {n} assets",
        asset_ids.len()
      )));
    }

    Ok(Self {
      mu: DVector::from_column_slice(mean_returns),
      cov,
      lower: bounds.iter().map(|b| b.0).collect(),
      upper: bounds.iter().map(|b| b.1).collect(),
      asset_ids,
      risk_free_rate,
    })
  }

  pub fn n_assets(&self) -> usize {
    self.mu.len()
  }

  pub fn bounds(&self) -> Vec<(f64, f64)> {
    self.lower.iter().copied().zip(self.upper.iter().copied()).collect()
  }

  pub(crate) fn expected_return(&self, w: &DVector<f64>) -> f64 {
    self.mu.dot(w)
  }

  pub(crate) fn volatility(&self, w: &DVector<f64>) -> f64 {
    linalg::quad_form(&self.cov, w).max(0.0).sqrt()
  }

  pub(crate) fn sharpe(&self, expected_return: f64, volatility: f64) -> f64 {
    if volatility > 1e-15 {
      (expected_return - self.risk_free_rate) / volatility
    } else {
      0.0
    }
  }

  /// Package weights into an [`OptimizationResult`].
  pub(crate) fn result(
    &self,
    mode: OptimizationMode,
    weights: DVector<f64>,
    objective_value: f64,
    constraints: OptimizationConstraints,
    converged: bool,
    iterations: usize,
  ) -> Result<OptimizationResult> {
    let cleaned: Vec<f64> = weights
      .iter()
      .zip(self.lower.iter().zip(&self.upper))
      .map(|(w, (lo, hi))| w.clamp(*lo, *hi))
      .collect();
    let w = DVector::from_column_slice(&cleaned);

    let expected_return = self.expected_return(&w);
    let expected_volatility = self.volatility(&w);
    let portfolio = Portfolio::new(self.asset_ids.clone(), cleaned, DEFAULT_WEIGHT_TOLERANCE)
      .map_err(|err| ComputeError::numerical(format!("optimizer produced invalid weights: {err}")))?;

    Ok(OptimizationResult {
      mode,
      objective_value,
      expected_return,
      expected_volatility,
      sharpe_ratio: self.sharpe(expected_return, expected_volatility),
      risk_contributions: linalg::risk_contributions(&self.cov, &w),
      portfolio,
      constraints,
      converged,
      iterations,
    })
  }
}

/// Output of a portfolio optimization run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizationResult {
  pub mode: OptimizationMode,
  /// Variance for mean-variance, squared risk-budget error for risk parity, Sharpe for max-Sharpe.
  pub objective_value: f64,
  pub portfolio: Portfolio,
  pub expected_return: f64,
  pub expected_volatility: f64,
  /// `(expected_return - risk_free) / expected_volatility`.
  pub sharpe_ratio: f64,
  /// Share of portfolio variance per asset.
  pub risk_contributions: Vec<f64>,
  pub constraints: OptimizationConstraints,
  pub converged: bool,
  pub iterations: usize,
}

impl OptimizationResult {
  pub fn weights(&self) -> Vec<f64> {
    self.portfolio.weights()
  }
}
