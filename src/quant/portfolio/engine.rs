//! # Portfolio Engine
//!
//! $$
//! \mathbf{w}^\* = \operatorname{Optimize}(\mu, \Sigma, \mathcal C)
//! $$
//!
//! High-level API for optimizer selection, frontier sampling and rebalancing.

use super::frontier::efficient_frontier;
use super::frontier::EfficientFrontier;
use super::optimizers::optimize_with_mode;
use super::optimizers::RISK_PARITY_MAX_ITERATIONS;
use super::optimizers::RISK_PARITY_TOLERANCE;
use super::rebalance::rebalance_weights;
use super::rebalance::RebalancePlan;
use super::rebalance::DEFAULT_REBALANCE_THRESHOLD;
use super::types::AllocationProblem;
use super::types::OptimizationConstraints;
use super::types::OptimizationMode;
use super::types::OptimizationResult;
use crate::error::Result;
use crate::quant::returns::DEFAULT_WEIGHT_TOLERANCE;

/// Runtime configuration for [`PortfolioEngine`].
#[derive(Clone, Debug)]
pub struct PortfolioEngineConfig {
  /// Optimizer used by [`PortfolioEngine::optimize`].
  pub mode: OptimizationMode,
  /// Annual risk-free rate used in Sharpe computations.
  pub risk_free: f64,
  pub risk_parity_tolerance: f64,
  pub max_iterations: usize,
  /// Points sampled by [`PortfolioEngine::frontier`].
  pub frontier_points: usize,
  pub rebalance_threshold: f64,
  pub weight_tolerance: f64,
}

impl Default for PortfolioEngineConfig {
  fn default() -> Self {
    Self {
      mode: OptimizationMode::MeanVariance,
      risk_free: 0.0,
      risk_parity_tolerance: RISK_PARITY_TOLERANCE,
      max_iterations: RISK_PARITY_MAX_ITERATIONS,
      frontier_points: 20,
      rebalance_threshold: DEFAULT_REBALANCE_THRESHOLD,
      weight_tolerance: DEFAULT_WEIGHT_TOLERANCE,
    }
  }
}

/// Single entry-point engine for allocation workflows.
#[derive(Clone, Debug, Default)]
pub struct PortfolioEngine {
  config: PortfolioEngineConfig,
}

impl PortfolioEngine {
  /// Construct a new engine with explicit configuration.
  pub fn new(config: PortfolioEngineConfig) -> Self {
    Self { config }
  }

  /// Borrow engine configuration.
  pub fn config(&self) -> &PortfolioEngineConfig {
    &self.config
  }

  fn problem(
    &self,
    mu: &[f64],
    cov: &[Vec<f64>],
    bounds: &[(f64, f64)],
    asset_ids: Option<Vec<String>>,
  ) -> Result<AllocationProblem> {
    let bounds = (!bounds.is_empty()).then_some(bounds);
    AllocationProblem::new(mu, cov, bounds, asset_ids, self.config.risk_free)
  }

  /// Optimize weights for supplied expected returns and covariance under `constraints`.
  pub fn optimize(
    &self,
    mu: &[f64],
    cov: &[Vec<f64>],
    constraints: &OptimizationConstraints,
    asset_ids: Option<Vec<String>>,
  ) -> Result<OptimizationResult> {
    let problem = self.problem(mu, cov, &constraints.bounds, asset_ids)?;
    optimize_with_mode(
      &problem,
      self.config.mode,
      constraints.target_return,
      constraints.target_volatility,
      self.config.risk_parity_tolerance,
      self.config.max_iterations,
    )
  }

  /// Sample the efficient frontier with `frontier_points` points.
  pub fn frontier(&self, mu: &[f64], cov: &[Vec<f64>], bounds: &[(f64, f64)]) -> Result<EfficientFrontier> {
    let problem = self.problem(mu, cov, bounds, None)?;
    efficient_frontier(&problem, self.config.frontier_points)
  }

  /// Trades needed to move from `current` to `target` weights.
  pub fn rebalance(
    &self,
    current: &[f64],
    target: &[f64],
    asset_ids: Option<Vec<String>>,
    portfolio_value: Option<f64>,
  ) -> Result<RebalancePlan> {
    rebalance_weights(
      current,
      target,
      asset_ids,
      self.config.rebalance_threshold,
      portfolio_value,
      self.config.weight_tolerance,
    )
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::error::ComputeError;

  fn two_assets() -> (Vec<f64>, Vec<Vec<f64>>) {
    (vec![0.08, 0.12], vec![vec![0.04, 0.01], vec![0.01, 0.09]])
  }

  #[test]
  fn two_asset_target_return() {
    let (mu, cov) = two_assets();
    let engine = PortfolioEngine::default();
    let constraints = OptimizationConstraints::long_only(2).with_target_return(0.10);
    let res = engine
      .optimize(&mu, &cov, &constraints, Some(vec!["EQ".into(), "EM".into()]))
      .unwrap();

    assert_abs_diff_eq!(res.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(res.expected_return, 0.10, epsilon = 1e-6);
    assert_abs_diff_eq!(res.weights()[0], 0.5, epsilon = 1e-6);
    assert_eq!(res.portfolio.asset_ids().collect::<Vec<_>>(), vec!["EQ", "EM"]);
  }

  #[test]
  fn target_above_both_assets_fails() {
    let (mu, cov) = two_assets();
    let engine = PortfolioEngine::default();
    let constraints = OptimizationConstraints::long_only(2).with_target_return(0.2);
    assert!(matches!(
      engine.optimize(&mu, &cov, &constraints, None),
      Err(ComputeError::Optimization(_))
    ));
  }

  #[test]
  fn mode_comes_from_config() {
    let (mu, cov) = two_assets();
    let engine = PortfolioEngine::new(PortfolioEngineConfig {
      mode: OptimizationMode::RiskParity,
      ..PortfolioEngineConfig::default()
    });
    let res = engine
      .optimize(&mu, &cov, &OptimizationConstraints::long_only(2), None)
      .unwrap();
    assert_eq!(res.mode, OptimizationMode::RiskParity);
    assert_abs_diff_eq!(res.risk_contributions[0], 0.5, epsilon = 1e-5);
  }

  #[test]
  fn frontier_and_rebalance_use_config() {
    let (mu, cov) = two_assets();
    let engine = PortfolioEngine::new(PortfolioEngineConfig {
      frontier_points: 7,
      rebalance_threshold: 0.1,
      ..PortfolioEngineConfig::default()
    });
    assert_eq!(engine.frontier(&mu, &cov, &[]).unwrap().points.len(), 7);

    let plan = engine.rebalance(&[0.5, 0.5], &[0.42, 0.58], None, None).unwrap();
    assert_eq!(plan.transactions_required, 0);
  }
}
