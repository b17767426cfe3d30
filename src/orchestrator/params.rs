//! Typed computation requests.
//!
//! A submission `{computation_name, parameters}` deserializes into
//! [`ComputationParams`]; missing optional fields are filled with their
//! defaults so the fingerprint only depends on the effective request.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ComputeError;
use crate::error::Result;
use crate::quant::linalg;
use crate::quant::monte_carlo::stress::check_initial_value;
use crate::quant::monte_carlo::stress::check_scenario;
use crate::quant::monte_carlo::StressScenario;
use crate::quant::portfolio::rebalance::check_trade_inputs;
use crate::quant::portfolio::AllocationProblem;
use crate::quant::portfolio::OptimizationMode;
use crate::quant::returns::validate_weights;
use crate::quant::returns::ReturnSeries;
use crate::quant::risk::var::check_confidence;
use crate::quant::risk::var::check_horizon;
use crate::quant::risk::VarMethod;
use crate::quant::PERIODS_PER_YEAR;

/// Worker pool a computation is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
  Risk,
  Optimization,
  Reporting,
  /// Cache sweeping; no computation is routed here.
  Maintenance,
}

impl Lane {
  /// Lanes that run computations.
  pub const COMPUTE: [Lane; 3] = [Lane::Risk, Lane::Optimization, Lane::Reporting];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Risk => "risk",
      Self::Optimization => "optimization",
      Self::Reporting => "reporting",
      Self::Maintenance => "maintenance",
    }
  }

  pub(crate) fn index(self) -> usize {
    match self {
      Self::Risk => 0,
      Self::Optimization => 1,
      Self::Reporting => 2,
      Self::Maintenance => 3,
    }
  }
}

impl fmt::Display for Lane {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Recognized computation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationKind {
  VarCvar,
  MonteCarloSimulation,
  EfficientFrontier,
  StressTest,
  OptimizePortfolio,
  RebalancePortfolio,
  PerformanceAnalysis,
}

impl ComputationKind {
  pub const ALL: [ComputationKind; 7] = [
    Self::VarCvar,
    Self::MonteCarloSimulation,
    Self::EfficientFrontier,
    Self::StressTest,
    Self::OptimizePortfolio,
    Self::RebalancePortfolio,
    Self::PerformanceAnalysis,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::VarCvar => "var_cvar",
      Self::MonteCarloSimulation => "monte_carlo_simulation",
      Self::EfficientFrontier => "efficient_frontier",
      Self::StressTest => "stress_test",
      Self::OptimizePortfolio => "optimize_portfolio",
      Self::RebalancePortfolio => "rebalance_portfolio",
      Self::PerformanceAnalysis => "performance_analysis",
    }
  }

  pub fn lane(self) -> Lane {
    match self {
      Self::VarCvar | Self::MonteCarloSimulation | Self::StressTest => Lane::Risk,
      Self::OptimizePortfolio | Self::EfficientFrontier | Self::RebalancePortfolio => Lane::Optimization,
      Self::PerformanceAnalysis => Lane::Reporting,
    }
  }
}

impl FromStr for ComputationKind {
  type Err = ComputeError;

  fn from_str(s: &str) -> Result<Self> {
    Self::ALL
      .into_iter()
      .find(|k| k.as_str() == s)
      .ok_or_else(|| ComputeError::validation(format!("unknown computation '{s}'")))
  }
}

impl fmt::Display for ComputationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

fn default_periods_per_year() -> f64 {
  PERIODS_PER_YEAR
}

fn default_num_simulations() -> usize {
  10_000
}

fn default_one() -> f64 {
  1.0
}

fn default_confidence() -> f64 {
  0.95
}

fn default_frontier_points() -> usize {
  20
}

fn default_threshold() -> f64 {
  0.05
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarCvarParams {
  /// `periods × assets`.
  pub returns: Vec<Vec<f64>>,
  pub weights: Vec<f64>,
  pub confidence: f64,
  pub horizon: i64,
  pub method: VarMethod,
  #[serde(default)]
  pub risk_free_rate: f64,
  #[serde(default = "default_periods_per_year")]
  pub periods_per_year: f64,
  #[serde(default)]
  pub benchmark: Option<Vec<f64>>,
  #[serde(default = "default_num_simulations")]
  pub num_simulations: usize,
  #[serde(default)]
  pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonteCarloParams {
  pub weights: Vec<f64>,
  pub mean_returns: Vec<f64>,
  pub covariance: Vec<Vec<f64>>,
  pub num_simulations: usize,
  pub horizon: i64,
  #[serde(default)]
  pub seed: Option<u64>,
  #[serde(default = "default_one")]
  pub initial_value: f64,
  #[serde(default = "default_confidence")]
  pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontierParams {
  pub mean_returns: Vec<f64>,
  pub covariance: Vec<Vec<f64>>,
  #[serde(default)]
  pub bounds: Option<Vec<(f64, f64)>>,
  #[serde(default = "default_frontier_points")]
  pub num_points: usize,
  #[serde(default)]
  pub risk_free_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StressTestParams {
  pub weights: Vec<f64>,
  pub scenarios: Vec<StressScenario>,
  #[serde(default = "default_one")]
  pub initial_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizeParams {
  pub mean_returns: Vec<f64>,
  pub covariance: Vec<Vec<f64>>,
  pub mode: OptimizationMode,
  #[serde(default)]
  pub target_return: Option<f64>,
  #[serde(default)]
  pub target_volatility: Option<f64>,
  #[serde(default)]
  pub bounds: Option<Vec<(f64, f64)>>,
  #[serde(default)]
  pub risk_free_rate: f64,
  #[serde(default)]
  pub asset_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RebalanceParams {
  pub current_weights: Vec<f64>,
  pub target_weights: Vec<f64>,
  #[serde(default = "default_threshold")]
  pub threshold: f64,
  #[serde(default)]
  pub asset_ids: Option<Vec<String>>,
  #[serde(default)]
  pub portfolio_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceParams {
  pub returns: Vec<Vec<f64>>,
  pub weights: Vec<f64>,
  #[serde(default)]
  pub benchmark: Option<Vec<f64>>,
  #[serde(default)]
  pub risk_free_rate: f64,
  #[serde(default = "default_periods_per_year")]
  pub periods_per_year: f64,
}

/// A named computation with its typed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "computation_name", content = "parameters", rename_all = "snake_case")]
pub enum ComputationParams {
  VarCvar(VarCvarParams),
  MonteCarloSimulation(MonteCarloParams),
  EfficientFrontier(FrontierParams),
  StressTest(StressTestParams),
  OptimizePortfolio(OptimizeParams),
  RebalancePortfolio(RebalanceParams),
  PerformanceAnalysis(PerformanceParams),
}

impl ComputationParams {
  /// Parse a `{computation_name, parameters}` submission.
  pub fn from_submission(computation_name: &str, parameters: Value) -> Result<Self> {
    computation_name.parse::<ComputationKind>()?;
    if !parameters.is_object() {
      return Err(ComputeError::validation(format!(
        "parameters for '{computation_name}' must be an object"
      )));
    }
    let envelope = serde_json::json!({
      "computation_name": computation_name,
      "parameters": parameters,
    });
    Ok(serde_json::from_value(envelope)?)
  }

  pub fn kind(&self) -> ComputationKind {
    match self {
      Self::VarCvar(_) => ComputationKind::VarCvar,
      Self::MonteCarloSimulation(_) => ComputationKind::MonteCarloSimulation,
      Self::EfficientFrontier(_) => ComputationKind::EfficientFrontier,
      Self::StressTest(_) => ComputationKind::StressTest,
      Self::OptimizePortfolio(_) => ComputationKind::OptimizePortfolio,
      Self::RebalancePortfolio(_) => ComputationKind::RebalancePortfolio,
      Self::PerformanceAnalysis(_) => ComputationKind::PerformanceAnalysis,
    }
  }

  pub fn lane(&self) -> Lane {
    self.kind().lane()
  }

  /// Shape and range checks done before anything is queued.
  pub fn validate(&self, weight_tolerance: f64) -> Result<()> {
    match self {
      Self::VarCvar(p) => {
        let series = ReturnSeries::new(&p.returns)?;
        check_min_periods(series.n_periods())?;
        check_weights_len(&p.weights, series.n_assets())?;
        validate_weights(&p.weights, weight_tolerance)?;
        check_confidence(p.confidence)?;
        check_horizon(p.horizon)?;
        check_periods_per_year(p.periods_per_year)?;
        check_benchmark(p.benchmark.as_deref(), series.n_periods())?;
        if p.method == VarMethod::MonteCarlo && p.num_simulations == 0 {
          return Err(ComputeError::validation("num_simulations must be positive"));
        }
        Ok(())
      }
      Self::MonteCarloSimulation(p) => {
        linalg::covariance_matrix(&p.covariance, p.mean_returns.len())?;
        check_weights_len(&p.weights, p.mean_returns.len())?;
        validate_weights(&p.weights, weight_tolerance)?;
        check_horizon(p.horizon)?;
        check_confidence(p.confidence)?;
        check_initial_value(p.initial_value)?;
        if p.num_simulations == 0 {
          return Err(ComputeError::validation("num_simulations must be positive"));
        }
        Ok(())
      }
      Self::EfficientFrontier(p) => {
        AllocationProblem::new(&p.mean_returns, &p.covariance, p.bounds.as_deref(), None, p.risk_free_rate)?;
        if p.num_points < 2 {
          return Err(ComputeError::validation(format!(
            "num_points must be at least 2, got {}",
            p.num_points
          )));
        }
        Ok(())
      }
      Self::StressTest(p) => {
        validate_weights(&p.weights, weight_tolerance)?;
        check_initial_value(p.initial_value)?;
        if p.scenarios.is_empty() {
          return Err(ComputeError::validation("at least one stress scenario is required"));
        }
        p.scenarios
          .iter()
          .try_for_each(|scenario| check_scenario(scenario, p.weights.len()))
      }
      Self::OptimizePortfolio(p) => {
        AllocationProblem::new(
          &p.mean_returns,
          &p.covariance,
          p.bounds.as_deref(),
          p.asset_ids.clone(),
          p.risk_free_rate,
        )?;
        if let Some(t) = p.target_return {
          if !t.is_finite() {
            return Err(ComputeError::validation("target return must be finite"));
          }
        }
        if let Some(v) = p.target_volatility {
          if !(v.is_finite() && v > 0.0) {
            return Err(ComputeError::validation(format!(
              "target volatility must be positive, got {v}"
            )));
          }
        }
        Ok(())
      }
      Self::RebalancePortfolio(p) => {
        check_weights_len(&p.target_weights, p.current_weights.len())?;
        validate_weights(&p.current_weights, weight_tolerance)?;
        validate_weights(&p.target_weights, weight_tolerance)?;
        check_trade_inputs(p.threshold, p.portfolio_value)
      }
      Self::PerformanceAnalysis(p) => {
        let series = ReturnSeries::new(&p.returns)?;
        check_min_periods(series.n_periods())?;
        check_weights_len(&p.weights, series.n_assets())?;
        validate_weights(&p.weights, weight_tolerance)?;
        check_periods_per_year(p.periods_per_year)?;
        check_benchmark(p.benchmark.as_deref(), series.n_periods())
      }
    }
  }
}

fn check_weights_len(weights: &[f64], n_assets: usize) -> Result<()> {
  if weights.len() != n_assets {
    return Err(ComputeError::validation(format!(
      "{} weights supplied for {n_assets} assets",
      weights.len()
    )));
  }
  Ok(())
}

fn check_min_periods(n_periods: usize) -> Result<()> {
  if n_periods < 2 {
    return Err(ComputeError::validation(format!(
      "at least two periods are required, got {n_periods}"
    )));
  }
  Ok(())
}

fn check_periods_per_year(ppy: f64) -> Result<()> {
  if !(ppy.is_finite() && ppy > 0.0) {
    return Err(ComputeError::validation(format!(
      "periods_per_year must be positive, got {ppy}"
    )));
  }
  Ok(())
}

fn check_benchmark(benchmark: Option<&[f64]>, n_periods: usize) -> Result<()> {
  match benchmark {
    Some(b) if b.len() != n_periods => Err(ComputeError::validation(format!(
      "benchmark has {} periods, returns have {n_periods}",
      b.len()
    ))),
    _ => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn var_payload() -> Value {
    json!({
      "returns": [[-0.02], [0.01], [-0.015], [0.03], [-0.01]],
      "weights": [1.0],
      "confidence": 0.95,
      "horizon": 1,
      "method": "historical"
    })
  }

  #[test]
  fn defaults_are_filled() {
    let params = ComputationParams::from_submission("var_cvar", var_payload()).unwrap();
    let ComputationParams::VarCvar(p) = &params else {
      panic!("wrong variant: {params:?}");
    };
    assert_eq!(p.periods_per_year, 252.0);
    assert_eq!(p.num_simulations, 10_000);
    assert_eq!(p.risk_free_rate, 0.0);
    assert_eq!(params.lane(), Lane::Risk);
    assert!(params.validate(1e-6).is_ok());
  }

  #[test]
  fn unknown_name_and_malformed_payloads_are_validation_errors() {
    assert!(matches!(
      ComputationParams::from_submission("black_scholes", json!({})),
      Err(ComputeError::Validation(_))
    ));
    assert!(matches!(
      ComputationParams::from_submission("var_cvar", json!({"weights": [1.0]})),
      Err(ComputeError::Validation(_))
    ));
    assert!(matches!(
      ComputationParams::from_submission("var_cvar", json!([1, 2])),
      Err(ComputeError::Validation(_))
    ));

    let mut extra = var_payload();
    extra["leverage"] = json!(3);
    assert!(ComputationParams::from_submission("var_cvar", extra).is_err());
  }

  #[test]
  fn validate_catches_ranges() {
    let mut bad = var_payload();
    bad["confidence"] = json!(1.2);
    let params = ComputationParams::from_submission("var_cvar", bad).unwrap();
    assert!(matches!(params.validate(1e-6), Err(ComputeError::Validation(_))));

    let mut bad = var_payload();
    bad["horizon"] = json!(0);
    let params = ComputationParams::from_submission("var_cvar", bad).unwrap();
    assert!(params.validate(1e-6).is_err());

    let frontier = ComputationParams::from_submission(
      "efficient_frontier",
      json!({"mean_returns": [0.1, 0.2], "covariance": [[0.04, 0.0], [0.0, 0.09]], "num_points": 1}),
    )
    .unwrap();
    assert!(frontier.validate(1e-6).is_err());
  }

  #[test]
  fn validate_rejects_out_of_range_requests() {
    let rejected = [
      (
        "optimize_portfolio",
        json!({"mean_returns": [0.08, 0.12], "covariance": [[0.04, 0.0], [0.0, 0.09]], "mode": "mean_variance", "bounds": [[0.0, 1.0]]}),
      ),
      (
        "optimize_portfolio",
        json!({"mean_returns": [0.08, 0.12], "covariance": [[0.04, 0.0], [0.0, 0.09]], "mode": "mean_variance", "bounds": [[0.6, 0.2], [0.0, 1.0]]}),
      ),
      (
        "optimize_portfolio",
        json!({"mean_returns": [0.08, 0.12], "covariance": [[0.04, 0.0], [0.0, 0.09]], "mode": "mean_variance", "target_volatility": -1.0}),
      ),
      (
        "efficient_frontier",
        json!({"mean_returns": [0.08, 0.12], "covariance": [[0.04, 0.0], [0.0, 0.09]], "bounds": [[0.0, 1.5], [0.0, 1.0]]}),
      ),
      (
        "stress_test",
        json!({"weights": [0.6, 0.4], "scenarios": [{"name": "crash", "shocks": [-0.3]}]}),
      ),
      (
        "stress_test",
        json!({"weights": [0.6, 0.4], "scenarios": [{"name": "wipeout", "shocks": [-1.5, 0.0]}]}),
      ),
      (
        "stress_test",
        json!({"weights": [1.0], "scenarios": [{"name": "flat", "shocks": [0.0]}], "initial_value": 0.0}),
      ),
      (
        "rebalance_portfolio",
        json!({"current_weights": [0.5, 0.5], "target_weights": [0.3, 0.7], "threshold": -0.01}),
      ),
      (
        "monte_carlo_simulation",
        json!({"weights": [1.0], "mean_returns": [0.0], "covariance": [[0.0001]], "num_simulations": 10, "horizon": 1, "initial_value": -5.0}),
      ),
      (
        "var_cvar",
        json!({"returns": [[0.01]], "weights": [1.0], "confidence": 0.95, "horizon": 1, "method": "historical"}),
      ),
      (
        "performance_analysis",
        json!({"returns": [[0.01, 0.02]], "weights": [0.5, 0.5]}),
      ),
    ];

    for (name, payload) in rejected {
      let params = ComputationParams::from_submission(name, payload.clone()).unwrap();
      assert!(
        matches!(params.validate(1e-6), Err(ComputeError::Validation(_))),
        "{name} accepted {payload}"
      );
    }
  }

  #[test]
  fn every_kind_round_trips_its_name() {
    for kind in ComputationKind::ALL {
      assert_eq!(kind.as_str().parse::<ComputationKind>().unwrap(), kind);
      assert_ne!(kind.lane(), Lane::Maintenance);
    }
  }
}
