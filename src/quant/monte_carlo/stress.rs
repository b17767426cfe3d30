//! # Stress Testing
//!
//! $$
//! \Delta V = V_0\,\mathbf{w}^\top \mathbf{s}
//! $$
//!
//! Deterministic shock scenarios applied once to the portfolio, no sampling.

use serde::Deserialize;
use serde::Serialize;

use crate::error::ComputeError;
use crate::error::Result;
use crate::quant::returns::validate_weights;
use crate::quant::returns::DEFAULT_WEIGHT_TOLERANCE;

/// Named per-asset return shock, e.g. `-0.30` equities, `+0.015` bonds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
  pub name: String,
  pub shocks: Vec<f64>,
}

/// Effect of one scenario.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StressOutcome {
  pub scenario: String,
  pub portfolio_return: f64,
  pub value_change: f64,
  pub stressed_value: f64,
  /// Per-asset `w_i s_i`.
  pub contributions: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StressTestReport {
  pub initial_value: f64,
  pub outcomes: Vec<StressOutcome>,
  /// Scenario with the lowest portfolio return.
  pub worst_scenario: Option<String>,
}

/// Shock count must match the weights; every shock finite and no worse than -100%.
pub(crate) fn check_scenario(scenario: &StressScenario, n_assets: usize) -> Result<()> {
  if scenario.shocks.len() != n_assets {
    return Err(ComputeError::validation(format!(
      "scenario '{}' has {} shocks for {n_assets} assets",
      scenario.name,
      scenario.shocks.len(),
    )));
  }
  if let Some(i) = scenario
    .shocks
    .iter()
    .position(|s| !s.is_finite() || *s < -1.0)
  {
    return Err(ComputeError::validation(format!(
      "scenario '{}' shock {i} must be finite and at least -100%",
      scenario.name
    )));
  }
  Ok(())
}

pub(crate) fn check_initial_value(initial_value: f64) -> Result<()> {
  if !(initial_value.is_finite() && initial_value > 0.0) {
    return Err(ComputeError::validation(format!(
      "initial value must be positive, got {initial_value}"
    )));
  }
  Ok(())
}

/// Apply a single scenario.
pub fn apply_shock(weights: &[f64], scenario: &StressScenario, initial_value: f64) -> Result<StressOutcome> {
  check_scenario(scenario, weights.len())?;

  let contributions: Vec<f64> = weights
    .iter()
    .zip(&scenario.shocks)
    .map(|(w, s)| w * s)
    .collect();
  let portfolio_return: f64 = contributions.iter().sum();

  Ok(StressOutcome {
    scenario: scenario.name.clone(),
    portfolio_return,
    value_change: initial_value * portfolio_return,
    stressed_value: initial_value * (1.0 + portfolio_return),
    contributions,
  })
}

/// Apply every scenario to the same portfolio.
pub fn stress_test(weights: &[f64], scenarios: &[StressScenario], initial_value: f64) -> Result<StressTestReport> {
  validate_weights(weights, DEFAULT_WEIGHT_TOLERANCE)?;
  if scenarios.is_empty() {
    return Err(ComputeError::validation("at least one stress scenario is required"));
  }
  check_initial_value(initial_value)?;

  let outcomes = scenarios
    .iter()
    .map(|s| apply_shock(weights, s, initial_value))
    .collect::<Result<Vec<_>>>()?;

  let worst_scenario = outcomes
    .iter()
    .min_by(|a, b| a.portfolio_return.total_cmp(&b.portfolio_return))
    .map(|o| o.scenario.clone());

  Ok(StressTestReport {
    initial_value,
    outcomes,
    worst_scenario,
  })
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  fn scenarios() -> Vec<StressScenario> {
    vec![
      StressScenario {
        name: "equity_crash".into(),
        shocks: vec![-0.30, 0.015],
      },
      StressScenario {
        name: "rates_up".into(),
        shocks: vec![-0.05, -0.08],
      },
    ]
  }

  #[test]
  fn equity_crash_scenario() {
    let report = stress_test(&[0.6, 0.4], &scenarios(), 1_000_000.0).unwrap();
    let crash = &report.outcomes[0];

    assert_abs_diff_eq!(crash.portfolio_return, -0.174, epsilon = 1e-12);
    assert_abs_diff_eq!(crash.value_change, -174_000.0, epsilon = 1e-6);
    assert_abs_diff_eq!(crash.stressed_value, 826_000.0, epsilon = 1e-6);
    assert_eq!(report.worst_scenario.as_deref(), Some("equity_crash"));
  }

  #[test]
  fn rejects_mismatched_or_impossible_shocks() {
    let short = vec![StressScenario {
      name: "short".into(),
      shocks: vec![-0.1],
    }];
    assert!(stress_test(&[0.5, 0.5], &short, 1.0).is_err());

    let wipeout = vec![StressScenario {
      name: "beyond_total_loss".into(),
      shocks: vec![-1.5, 0.0],
    }];
    assert!(stress_test(&[0.5, 0.5], &wipeout, 1.0).is_err());
    assert!(stress_test(&[0.5, 0.5], &[], 1.0).is_err());
  }
}
