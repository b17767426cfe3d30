//! # Return Metrics
//!
//! $$
//! S = \frac{\bar r - r_f/k}{s_r}\sqrt{k},\qquad
//! \mathrm{MDD} = \min_t\left(\frac{V_t}{\max_{s\le t} V_s} - 1\right),\qquad
//! \beta = \frac{\operatorname{Cov}(r, b)}{\operatorname{Var}(b)}
//! $$
//!
//! Single-series statistics and the performance report.

use serde::Serialize;

use crate::error::ComputeError;
use crate::error::Result;

pub(crate) fn sample_mean(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    0.0
  } else {
    xs.iter().sum::<f64>() / xs.len() as f64
  }
}

/// Sample standard deviation (`ddof = 1`).
pub fn sample_std(xs: &[f64]) -> Result<f64> {
  if xs.len() < 2 {
    return Err(ComputeError::validation(
      "at least two periods are required for a standard deviation",
    ));
  }
  let mean = sample_mean(xs);
  let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
  Ok(var.sqrt())
}

fn sample_cov(x: &[f64], y: &[f64]) -> f64 {
  let mx = sample_mean(x);
  let my = sample_mean(y);
  x.iter()
    .zip(y)
    .map(|(a, b)| (a - mx) * (b - my))
    .sum::<f64>()
    / (x.len() - 1) as f64
}

/// Annualized Sharpe ratio; `risk_free_rate` is annual.
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> Result<f64> {
  let std = sample_std(returns)?;
  if std <= f64::EPSILON {
    return Err(ComputeError::numerical(
      "Sharpe ratio undefined: return standard deviation is zero",
    ));
  }
  let excess = sample_mean(returns) - risk_free_rate / periods_per_year;
  Ok(excess / std * periods_per_year.sqrt())
}

/// Deepest peak-to-trough decline of the compounded series (a value in `[-1, 0]`).
pub fn max_drawdown(returns: &[f64]) -> f64 {
  let mut value = 1.0_f64;
  let mut peak = 1.0_f64;
  let mut worst = 0.0_f64;

  for r in returns {
    value *= 1.0 + r;
    peak = peak.max(value);
    worst = worst.min(value / peak - 1.0);
  }

  worst
}

/// `(beta, alpha)` of `returns` against `benchmark`, per period.
pub fn beta_alpha(returns: &[f64], benchmark: &[f64]) -> Result<(f64, f64)> {
  if returns.len() != benchmark.len() {
    return Err(ComputeError::validation(format!(
      "benchmark has {} periods, series has {}",
      benchmark.len(),
      returns.len()
    )));
  }
  if returns.len() < 2 {
    return Err(ComputeError::validation(
      "at least two periods are required for beta",
    ));
  }

  let var_b = sample_cov(benchmark, benchmark);
  if var_b <= f64::EPSILON * f64::EPSILON {
    return Err(ComputeError::numerical(
      "beta undefined: benchmark variance is zero",
    ));
  }

  let beta = sample_cov(returns, benchmark) / var_b;
  let alpha = sample_mean(returns) - beta * sample_mean(benchmark);
  Ok((beta, alpha))
}

/// Historical performance summary of a portfolio return series.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceReport {
  pub periods: usize,
  pub total_return: f64,
  /// Geometric annualized return.
  pub annualized_return: f64,
  pub annualized_volatility: f64,
  pub sharpe_ratio: f64,
  /// Absent when no period falls below the risk-free rate.
  pub sortino_ratio: Option<f64>,
  pub max_drawdown: f64,
  /// Absent when there is no drawdown.
  pub calmar_ratio: Option<f64>,
  pub beta: Option<f64>,
  pub alpha: Option<f64>,
  pub information_ratio: Option<f64>,
}

/// Build a [`PerformanceReport`]; benchmark-relative fields are filled when `benchmark` is given.
pub fn performance_report(
  returns: &[f64],
  benchmark: Option<&[f64]>,
  risk_free_rate: f64,
  periods_per_year: f64,
) -> Result<PerformanceReport> {
  if !(periods_per_year.is_finite() && periods_per_year > 0.0) {
    return Err(ComputeError::validation(format!(
      "periods_per_year must be positive, got {periods_per_year}"
    )));
  }

  let std = sample_std(returns)?;
  let sharpe_ratio = sharpe_ratio(returns, risk_free_rate, periods_per_year)?;

  let growth: f64 = returns.iter().map(|r| 1.0 + r).product();
  let total_return = growth - 1.0;
  let years = returns.len() as f64 / periods_per_year;
  let annualized_return = if growth > 0.0 {
    growth.powf(1.0 / years) - 1.0
  } else {
    -1.0
  };

  let rf_period = risk_free_rate / periods_per_year;
  let downside: Vec<f64> = returns
    .iter()
    .map(|r| (r - rf_period).min(0.0))
    .collect();
  let downside_dev = (downside.iter().map(|d| d * d).sum::<f64>() / returns.len() as f64).sqrt();
  let sortino_ratio = (downside_dev > f64::EPSILON)
    .then(|| (sample_mean(returns) - rf_period) / downside_dev * periods_per_year.sqrt());

  let max_drawdown = max_drawdown(returns);
  let calmar_ratio = (max_drawdown < 0.0).then(|| annualized_return / max_drawdown.abs());

  let (beta, alpha, information_ratio) = match benchmark {
    Some(bench) => {
      let (beta, alpha) = beta_alpha(returns, bench)?;
      let active: Vec<f64> = returns.iter().zip(bench).map(|(r, b)| r - b).collect();
      let tracking = sample_std(&active)?;
      let ir = (tracking > f64::EPSILON)
        .then(|| sample_mean(&active) / tracking * periods_per_year.sqrt());
      (Some(beta), Some(alpha), ir)
    }
    None => (None, None, None),
  };

  Ok(PerformanceReport {
    periods: returns.len(),
    total_return,
    annualized_return,
    annualized_volatility: std * periods_per_year.sqrt(),
    sharpe_ratio,
    sortino_ratio,
    max_drawdown,
    calmar_ratio,
    beta,
    alpha,
    information_ratio,
  })
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  #[test]
  fn drawdown_tracks_running_peak() {
    // 1.0 -> 1.1 -> 0.88 -> 0.968 -> 1.0648
    let mdd = max_drawdown(&[0.1, -0.2, 0.1, 0.1]);
    assert_abs_diff_eq!(mdd, -0.2, epsilon = 1e-12);
    assert_eq!(max_drawdown(&[0.01, 0.02, 0.03]), 0.0);
  }

  #[test]
  fn beta_of_scaled_benchmark() {
    let bench = [0.01, -0.02, 0.015, 0.005, -0.01];
    let asset: Vec<f64> = bench.iter().map(|b| 1.5 * b + 0.001).collect();
    let (beta, alpha) = beta_alpha(&asset, &bench).unwrap();

    assert_abs_diff_eq!(beta, 1.5, epsilon = 1e-12);
    assert_abs_diff_eq!(alpha, 0.001, epsilon = 1e-12);
  }

  #[test]
  fn flat_benchmark_is_numerical_error() {
    let result = beta_alpha(&[0.01, 0.02], &[0.0, 0.0]);
    assert!(matches!(result, Err(ComputeError::Numerical(_))));
  }

  #[test]
  fn sharpe_of_constant_series_is_numerical_error() {
    assert!(matches!(
      sharpe_ratio(&[0.01, 0.01, 0.01], 0.0, 252.0),
      Err(ComputeError::Numerical(_))
    ));
  }

  #[test]
  fn sharpe_is_annualized() {
    let returns = [0.01, -0.005, 0.02, 0.0];
    let mean = 0.00625;
    let std = sample_std(&returns).unwrap();
    let s = sharpe_ratio(&returns, 0.0, 252.0).unwrap();
    assert_abs_diff_eq!(s, mean / std * 252f64.sqrt(), epsilon = 1e-12);
  }

  #[test]
  fn performance_report_with_benchmark() {
    let returns = [0.01, -0.02, 0.015, 0.007, -0.004, 0.012];
    let bench = [0.008, -0.015, 0.01, 0.004, -0.002, 0.01];
    let report = performance_report(&returns, Some(&bench), 0.02, 252.0).unwrap();

    assert_eq!(report.periods, 6);
    assert!(report.max_drawdown < 0.0);
    assert!(report.calmar_ratio.is_some());
    assert!(report.sortino_ratio.is_some());
    assert!(report.beta.unwrap() > 1.0);
    assert!(report.information_ratio.is_some());

    let growth: f64 = returns.iter().map(|r| 1.0 + r).product();
    assert_abs_diff_eq!(report.total_return, growth - 1.0, epsilon = 1e-15);
  }
}
