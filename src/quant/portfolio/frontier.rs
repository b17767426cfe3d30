//! # Efficient Frontier
//!
//! $$
//! \mathcal F = \{(\sigma(r), r) : r \in [r_{\mathrm{gmv}}, r_{\max}]\},\qquad
//! \sigma(r) = \min_{\mu^\top\mathbf{w}=r}\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}
//! $$
//!
//! Sampled from the minimum-variance portfolio up to the highest reachable return,
//! so risk is non-decreasing along the returned points.

use serde::Serialize;
use tracing::debug;

use super::optimizers::optimize_mean_variance;
use super::qp;
use super::types::AllocationProblem;
use super::types::OptimizationResult;
use crate::error::ComputeError;
use crate::error::Result;

/// One sampled frontier point: the full mean-variance result at `target_return`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrontierPoint {
  pub target_return: f64,
  #[serde(flatten)]
  pub result: OptimizationResult,
}

impl FrontierPoint {
  pub fn expected_volatility(&self) -> f64 {
    self.result.expected_volatility
  }

  pub fn weights(&self) -> Vec<f64> {
    self.result.weights()
  }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EfficientFrontier {
  pub asset_ids: Vec<String>,
  /// Sorted by increasing target return.
  pub points: Vec<FrontierPoint>,
  pub min_variance_index: usize,
  /// Highest Sharpe ratio among the sampled points.
  pub max_sharpe_index: usize,
}

/// Sample `num_points` frontier portfolios with evenly spaced target returns.
pub fn efficient_frontier(problem: &AllocationProblem, num_points: usize) -> Result<EfficientFrontier> {
  if num_points < 2 {
    return Err(ComputeError::validation(format!(
      "efficient frontier needs at least 2 points, got {num_points}"
    )));
  }

  let gmv = optimize_mean_variance(problem, None)?;
  let r_lo = gmv.expected_return;
  let (_, r_hi) = qp::return_range(&problem.mu, &problem.lower, &problem.upper)?;

  let mut points = vec![FrontierPoint {
    target_return: r_lo,
    result: gmv,
  }];
  if r_hi - r_lo > 1e-12 * (1.0 + r_hi.abs()) {
    let step = (r_hi - r_lo) / (num_points - 1) as f64;
    for k in 1..num_points {
      let target = if k == num_points - 1 { r_hi } else { r_lo + step * k as f64 };
      let result = optimize_mean_variance(problem, Some(target))?;
      points.push(FrontierPoint {
        target_return: target,
        result,
      });
    }
  }

  let max_sharpe_index = points
    .iter()
    .enumerate()
    .max_by(|a, b| a.1.result.sharpe_ratio.total_cmp(&b.1.result.sharpe_ratio))
    .map(|(i, _)| i)
    .unwrap_or(0);

  debug!(points = points.len(), r_lo, r_hi, "efficient frontier sampled");

  Ok(EfficientFrontier {
    asset_ids: problem.asset_ids.clone(),
    points,
    min_variance_index: 0,
    max_sharpe_index,
  })
}
