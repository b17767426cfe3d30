//! # Portfolio Optimizers
//!
//! $$
//! \min_{\mathbf{w}} \mathbf{w}^\top\Sigma\mathbf{w},\qquad
//! w_i(\Sigma\mathbf{w})_i = \tfrac1n\,\mathbf{w}^\top\Sigma\mathbf{w},\qquad
//! \max_{\mathbf{w}} \frac{\mu^\top\mathbf{w}-r_f}{\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}}
//! $$
//!
//! Long-only allocation under box bounds: mean-variance (optionally at a
//! target return or volatility), risk parity and maximum Sharpe.

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::solver::goldensectionsearch::GoldenSectionSearch;
use nalgebra::DVector;
use tracing::debug;
use tracing::warn;

use super::qp;
use super::types::AllocationProblem;
use super::types::OptimizationConstraints;
use super::types::OptimizationMode;
use super::types::OptimizationResult;
use crate::error::ComputeError;
use crate::error::Result;
use crate::quant::linalg;

/// Convergence tolerance on the largest relative risk-budget miss.
pub const RISK_PARITY_TOLERANCE: f64 = 1e-6;
pub const RISK_PARITY_MAX_ITERATIONS: usize = 10_000;

const VOL_TOL: f64 = 1e-10;

fn constraints_of(problem: &AllocationProblem) -> OptimizationConstraints {
  OptimizationConstraints::long_only(problem.n_assets()).with_bounds(problem.bounds())
}

/// Minimum-variance portfolio, at `target_return` when given.
pub fn optimize_mean_variance(problem: &AllocationProblem, target_return: Option<f64>) -> Result<OptimizationResult> {
  let sol = qp::min_variance(&problem.cov, &problem.mu, &problem.lower, &problem.upper, target_return)?;
  let variance = linalg::quad_form(&problem.cov, &sol.weights);

  let mut constraints = constraints_of(problem);
  constraints.target_return = target_return;

  problem.result(
    OptimizationMode::MeanVariance,
    sol.weights,
    variance,
    constraints,
    true,
    sol.iterations,
  )
}

/// Highest-return frontier portfolio whose volatility does not exceed `target_volatility`.
pub fn optimize_target_volatility(problem: &AllocationProblem, target_volatility: f64) -> Result<OptimizationResult> {
  if !(target_volatility.is_finite() && target_volatility > 0.0) {
    return Err(ComputeError::validation(format!(
      "target volatility must be positive, got {target_volatility}"
    )));
  }

  let gmv = optimize_mean_variance(problem, None)?;
  if gmv.expected_volatility > target_volatility + VOL_TOL {
    return Err(ComputeError::optimization(format!(
      "target volatility {target_volatility:.6} is below the minimum achievable {:.6}",
      gmv.expected_volatility
    )));
  }

  let (_, r_max) = qp::return_range(&problem.mu, &problem.lower, &problem.upper)?;
  let top = optimize_mean_variance(problem, Some(r_max))?;
  let mut best = if top.expected_volatility <= target_volatility + VOL_TOL {
    top
  } else {
    // Volatility is monotone in the target return along the efficient branch.
    let mut lo = gmv.expected_return;
    let mut hi = r_max;
    let mut best = gmv;
    for _ in 0..200 {
      if hi - lo <= 1e-12 * (1.0 + hi.abs()) {
        break;
      }
      let mid = 0.5 * (lo + hi);
      let candidate = optimize_mean_variance(problem, Some(mid))?;
      if candidate.expected_volatility <= target_volatility + VOL_TOL {
        lo = mid;
        best = candidate;
      } else {
        hi = mid;
      }
    }
    best
  };

  best.constraints.target_return = None;
  best.constraints.target_volatility = Some(target_volatility);
  Ok(best)
}

/// Mean-variance with both targets: the return target is binding, the volatility target a cap.
fn optimize_with_both_targets(problem: &AllocationProblem, target_return: f64, target_volatility: f64) -> Result<OptimizationResult> {
  let mut result = optimize_mean_variance(problem, Some(target_return))?;
  if result.expected_volatility > target_volatility + VOL_TOL {
    return Err(ComputeError::optimization(format!(
      "target return {target_return:.6} needs volatility {:.6}, above the target {target_volatility:.6}",
      result.expected_volatility
    )));
  }
  result.constraints.target_volatility = Some(target_volatility);
  Ok(result)
}

/// Equal risk contribution portfolio by cyclical coordinate descent on
/// `½ yᵀΣy - (1/n) Σ ln y_i`, normalized afterwards.
///
/// Returns the best iterate with `converged = false` if `max_iterations` runs out.
pub fn optimize_risk_parity(problem: &AllocationProblem, tolerance: f64, max_iterations: usize) -> Result<OptimizationResult> {
  let n = problem.n_assets();
  let cov = &problem.cov;
  if let Some(i) = (0..n).find(|&i| cov[(i, i)] <= 0.0) {
    return Err(ComputeError::numerical(format!(
      "risk parity undefined: asset {i} has zero variance"
    )));
  }

  let budget = 1.0 / n as f64;
  let mut y = DVector::from_iterator(n, (0..n).map(|i| 1.0 / cov[(i, i)].sqrt()));
  let mut best = (f64::INFINITY, y.clone());
  let mut converged = false;
  let mut iterations = 0;

  for iter in 1..=max_iterations.max(1) {
    iterations = iter;
    for i in 0..n {
      let cross = (0..n)
        .filter(|&j| j != i)
        .map(|j| cov[(i, j)] * y[j])
        .sum::<f64>();
      let sii = cov[(i, i)];
      y[i] = (-cross + (cross * cross + 4.0 * sii * budget).sqrt()) / (2.0 * sii);
    }

    let w = &y / y.sum();
    let miss = linalg::risk_contributions(cov, &w)
      .iter()
      .map(|rc| (rc - budget).abs() / budget)
      .fold(0.0, f64::max);

    if miss < best.0 {
      best = (miss, w);
    }
    if miss < tolerance {
      converged = true;
      break;
    }
  }

  let (miss, w) = best;
  if !converged {
    warn!(iterations, miss, "risk parity did not converge, returning best iterate");
  }

  let tol = 1e-9;
  if let Some(i) = (0..n).find(|&i| w[i] < problem.lower[i] - tol || w[i] > problem.upper[i] + tol) {
    return Err(ComputeError::optimization(format!(
      "risk parity weight {:.6} for asset {i} violates bounds ({}, {})",
      w[i], problem.lower[i], problem.upper[i]
    )));
  }

  let objective = linalg::risk_contributions(cov, &w)
    .iter()
    .map(|rc| (rc - budget).powi(2))
    .sum::<f64>();

  problem.result(
    OptimizationMode::RiskParity,
    w,
    objective,
    constraints_of(problem),
    converged,
    iterations,
  )
}

/// Tangency portfolio: golden-section search over target returns on the efficient branch.
pub fn optimize_max_sharpe(problem: &AllocationProblem) -> Result<OptimizationResult> {
  struct NegativeSharpe {
    problem: AllocationProblem,
  }

  impl CostFunction for NegativeSharpe {
    type Param = f64;
    type Output = f64;

    fn cost(&self, target: &Self::Param) -> anyhow::Result<Self::Output> {
      let res = optimize_mean_variance(&self.problem, Some(*target)).map_err(anyhow::Error::from)?;
      if res.expected_volatility <= VOL_TOL {
        return Ok(-(res.expected_return - self.problem.risk_free_rate) * 1e12);
      }
      Ok(-res.sharpe_ratio)
    }
  }

  let gmv = optimize_mean_variance(problem, None)?;
  let r_lo = gmv.expected_return;
  let (_, r_hi) = qp::return_range(&problem.mu, &problem.lower, &problem.upper)?;

  let tangent_target = if r_hi - r_lo <= 1e-12 * (1.0 + r_hi.abs()) {
    r_lo
  } else {
    let solver = GoldenSectionSearch::new(r_lo, r_hi)
      .and_then(|gss| gss.with_tolerance(1e-8))
      .map_err(|err| ComputeError::optimization(err.to_string()))?;
    let init = 0.5 * (r_lo + r_hi);

    match Executor::new(NegativeSharpe { problem: problem.clone() }, solver)
      .configure(|state| state.param(init).max_iters(200))
      .run()
    {
      Ok(res) => res.state.best_param.unwrap_or(init),
      Err(err) => {
        return Err(match err.downcast::<ComputeError>() {
          Ok(inner) => inner,
          Err(other) => ComputeError::optimization(other.to_string()),
        })
      }
    }
  };

  // The search interval includes the minimum-variance end, so compare against it explicitly.
  let mut result = optimize_mean_variance(problem, Some(tangent_target))?;
  if gmv.sharpe_ratio > result.sharpe_ratio {
    result = gmv;
  }
  debug!(target = tangent_target, sharpe = result.sharpe_ratio, "max sharpe search finished");

  result.mode = OptimizationMode::MaxSharpe;
  result.objective_value = result.sharpe_ratio;
  result.constraints.target_return = None;
  Ok(result)
}

/// Dispatch on mode and targets.
pub fn optimize_with_mode(
  problem: &AllocationProblem,
  mode: OptimizationMode,
  target_return: Option<f64>,
  target_volatility: Option<f64>,
  risk_parity_tolerance: f64,
  risk_parity_max_iterations: usize,
) -> Result<OptimizationResult> {
  match mode {
    OptimizationMode::MeanVariance => match (target_return, target_volatility) {
      (Some(r), Some(v)) => optimize_with_both_targets(problem, r, v),
      (None, Some(v)) => optimize_target_volatility(problem, v),
      (r, None) => optimize_mean_variance(problem, r),
    },
    OptimizationMode::RiskParity => optimize_risk_parity(problem, risk_parity_tolerance, risk_parity_max_iterations),
    OptimizationMode::MaxSharpe => optimize_max_sharpe(problem),
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  fn three_assets(bounds: Option<&[(f64, f64)]>) -> AllocationProblem {
    let mu = [0.08, 0.12, 0.05];
    let cov = vec![
      vec![0.04, 0.006, 0.002],
      vec![0.006, 0.09, 0.01],
      vec![0.002, 0.01, 0.0225],
    ];
    AllocationProblem::new(&mu, &cov, bounds, None, 0.02).unwrap()
  }

  fn assert_valid(result: &OptimizationResult) {
    let weights = result.weights();
    assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
    for (w, (lo, hi)) in weights.iter().zip(&result.constraints.bounds) {
      assert!(*w >= lo - 1e-9 && *w <= hi + 1e-9, "{w} outside ({lo}, {hi})");
    }
  }

  #[test]
  fn mean_variance_hits_target_return() {
    let result = optimize_mean_variance(&three_assets(None), Some(0.09)).unwrap();
    assert_valid(&result);
    assert_abs_diff_eq!(result.expected_return, 0.09, epsilon = 1e-6);
    assert_eq!(result.constraints.target_return, Some(0.09));
  }

  #[test]
  fn target_above_best_asset_is_optimization_error() {
    let result = optimize_mean_variance(&three_assets(None), Some(0.5));
    assert!(matches!(result, Err(ComputeError::Optimization(_))));
  }

  #[test]
  fn bounds_are_respected() {
    let bounds = [(0.1, 0.5), (0.1, 0.3), (0.2, 0.6)];
    let result = optimize_mean_variance(&three_assets(Some(&bounds)), Some(0.085)).unwrap();
    assert_valid(&result);
    assert!(result.weights()[1] <= 0.3 + 1e-9);
  }

  #[test]
  fn target_volatility_is_not_exceeded() {
    let problem = three_assets(None);
    let gmv = optimize_mean_variance(&problem, None).unwrap();
    let target = gmv.expected_volatility + 0.02;
    let result = optimize_target_volatility(&problem, target).unwrap();

    assert_valid(&result);
    assert!(result.expected_volatility <= target + 1e-8);
    assert!(result.expected_return > gmv.expected_return);
    assert_abs_diff_eq!(result.expected_volatility, target, epsilon = 1e-6);
  }

  #[test]
  fn target_volatility_below_minimum_is_rejected() {
    let result = optimize_target_volatility(&three_assets(None), 0.01);
    assert!(matches!(result, Err(ComputeError::Optimization(_))));
  }

  #[test]
  fn risk_parity_equalizes_contributions() {
    let result = optimize_risk_parity(&three_assets(None), RISK_PARITY_TOLERANCE, RISK_PARITY_MAX_ITERATIONS).unwrap();
    assert_valid(&result);
    assert!(result.converged);
    for rc in &result.risk_contributions {
      assert_abs_diff_eq!(*rc, 1.0 / 3.0, epsilon = 1e-5);
    }
  }

  #[test]
  fn risk_parity_with_diagonal_covariance_is_inverse_volatility() {
    let cov = vec![vec![0.04, 0.0], vec![0.0, 0.01]];
    let problem = AllocationProblem::new(&[0.1, 0.05], &cov, None, None, 0.0).unwrap();
    let result = optimize_risk_parity(&problem, RISK_PARITY_TOLERANCE, RISK_PARITY_MAX_ITERATIONS).unwrap();

    assert_abs_diff_eq!(result.weights()[0], 1.0 / 3.0, epsilon = 1e-6);
    assert_abs_diff_eq!(result.weights()[1], 2.0 / 3.0, epsilon = 1e-6);
  }

  #[test]
  fn risk_parity_rejects_zero_variance_asset() {
    let cov = vec![vec![0.04, 0.0], vec![0.0, 0.0]];
    let problem = AllocationProblem::new(&[0.1, 0.05], &cov, None, None, 0.0).unwrap();
    let result = optimize_risk_parity(&problem, RISK_PARITY_TOLERANCE, RISK_PARITY_MAX_ITERATIONS);
    assert!(matches!(result, Err(ComputeError::Numerical(_))));
  }

  #[test]
  fn risk_parity_outside_bounds_is_optimization_error() {
    let bounds = [(0.0, 0.2), (0.0, 1.0), (0.0, 1.0)];
    let result = optimize_risk_parity(&three_assets(Some(&bounds)), RISK_PARITY_TOLERANCE, RISK_PARITY_MAX_ITERATIONS);
    assert!(matches!(result, Err(ComputeError::Optimization(_))));
  }

  #[test]
  fn max_sharpe_beats_frontier_neighbours() {
    let problem = three_assets(None);
    let tangency = optimize_max_sharpe(&problem).unwrap();
    assert_valid(&tangency);
    assert_eq!(tangency.mode, OptimizationMode::MaxSharpe);

    for target in [0.06, 0.08, 0.1, 0.11] {
      let other = optimize_mean_variance(&problem, Some(target)).unwrap();
      assert!(tangency.sharpe_ratio >= other.sharpe_ratio - 1e-6, "{target}");
    }
  }

  #[test]
  fn dispatch_honours_both_targets() {
    let problem = three_assets(None);
    let ok = optimize_with_mode(&problem, OptimizationMode::MeanVariance, Some(0.08), Some(0.5), 1e-6, 100).unwrap();
    assert_eq!(ok.constraints.target_volatility, Some(0.5));

    let too_tight = optimize_with_mode(&problem, OptimizationMode::MeanVariance, Some(0.115), Some(0.1), 1e-6, 100);
    assert!(matches!(too_tight, Err(ComputeError::Optimization(_))));
  }
}
