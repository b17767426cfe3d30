//! Dispatch of typed requests to the calculators.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::params::ComputationParams;
use super::params::FrontierParams;
use super::params::MonteCarloParams;
use super::params::OptimizeParams;
use super::params::PerformanceParams;
use super::params::RebalanceParams;
use super::params::VarCvarParams;
use crate::error::ComputeError;
use crate::error::Result;
use crate::quant::monte_carlo::stress_test;
use crate::quant::monte_carlo::MonteCarloEngine;
use crate::quant::monte_carlo::SimulationSpec;
use crate::quant::portfolio::OptimizationConstraints;
use crate::quant::portfolio::PortfolioEngine;
use crate::quant::portfolio::PortfolioEngineConfig;
use crate::quant::returns::validate_weights;
use crate::quant::returns::ReturnSeries;
use crate::quant::returns::DEFAULT_WEIGHT_TOLERANCE;
use crate::quant::risk::metrics::performance_report;
use crate::quant::risk::var::check_horizon;
use crate::quant::risk::RiskCalculator;
use crate::quant::risk::RiskConfig;

/// Runs one computation synchronously; called on a blocking thread.
pub trait ComputationExecutor: Send + Sync + 'static {
  fn execute(&self, params: &ComputationParams) -> Result<Value>;
}

/// Executor backed by the in-crate calculators.
#[derive(Debug, Clone)]
pub struct EngineExecutor {
  weight_tolerance: f64,
}

impl Default for EngineExecutor {
  fn default() -> Self {
    Self::new(DEFAULT_WEIGHT_TOLERANCE)
  }
}

impl EngineExecutor {
  pub fn new(weight_tolerance: f64) -> Self {
    Self { weight_tolerance }
  }

  fn var_cvar(&self, p: &VarCvarParams) -> Result<Value> {
    let series = ReturnSeries::new(&p.returns)?;
    let calc = RiskCalculator::new(RiskConfig {
      confidence: p.confidence,
      horizon: p.horizon,
      method: p.method,
      risk_free_rate: p.risk_free_rate,
      periods_per_year: p.periods_per_year,
      num_simulations: p.num_simulations,
      seed: p.seed,
      weight_tolerance: self.weight_tolerance,
    });
    to_payload(&calc.assess(&series, &p.weights, p.benchmark.as_deref())?)
  }

  fn monte_carlo(&self, p: &MonteCarloParams) -> Result<Value> {
    let spec = SimulationSpec::new(
      p.weights.clone(),
      p.mean_returns.clone(),
      p.covariance.clone(),
      p.num_simulations,
      check_horizon(p.horizon)?,
      p.seed,
      Some(p.initial_value),
    );
    let engine = MonteCarloEngine::new(&spec)?;
    to_payload(&engine.summarize(p.confidence)?)
  }

  fn portfolio_engine(&self, config: PortfolioEngineConfig) -> PortfolioEngine {
    PortfolioEngine::new(PortfolioEngineConfig {
      weight_tolerance: self.weight_tolerance,
      ..config
    })
  }

  fn frontier(&self, p: &FrontierParams) -> Result<Value> {
    let engine = self.portfolio_engine(PortfolioEngineConfig {
      risk_free: p.risk_free_rate,
      frontier_points: p.num_points,
      ..PortfolioEngineConfig::default()
    });
    let bounds = p.bounds.clone().unwrap_or_default();
    to_payload(&engine.frontier(&p.mean_returns, &p.covariance, &bounds)?)
  }

  fn optimize(&self, p: &OptimizeParams) -> Result<Value> {
    let engine = self.portfolio_engine(PortfolioEngineConfig {
      mode: p.mode,
      risk_free: p.risk_free_rate,
      ..PortfolioEngineConfig::default()
    });
    let constraints = OptimizationConstraints {
      bounds: p.bounds.clone().unwrap_or_default(),
      target_return: p.target_return,
      target_volatility: p.target_volatility,
    };
    let result = engine.optimize(&p.mean_returns, &p.covariance, &constraints, p.asset_ids.clone())?;
    to_payload(&result)
  }

  fn rebalance(&self, p: &RebalanceParams) -> Result<Value> {
    let engine = self.portfolio_engine(PortfolioEngineConfig {
      rebalance_threshold: p.threshold,
      ..PortfolioEngineConfig::default()
    });
    let plan = engine.rebalance(&p.current_weights, &p.target_weights, p.asset_ids.clone(), p.portfolio_value)?;
    to_payload(&plan)
  }

  fn performance(&self, p: &PerformanceParams) -> Result<Value> {
    let series = ReturnSeries::new(&p.returns)?;
    validate_weights(&p.weights, self.weight_tolerance)?;
    let port = series.portfolio_returns(&p.weights)?.to_vec();
    let report = performance_report(&port, p.benchmark.as_deref(), p.risk_free_rate, p.periods_per_year)?;
    to_payload(&report)
  }
}

impl ComputationExecutor for EngineExecutor {
  fn execute(&self, params: &ComputationParams) -> Result<Value> {
    debug!(computation = %params.kind(), "executing computation");
    match params {
      ComputationParams::VarCvar(p) => self.var_cvar(p),
      ComputationParams::MonteCarloSimulation(p) => self.monte_carlo(p),
      ComputationParams::EfficientFrontier(p) => self.frontier(p),
      ComputationParams::StressTest(p) => to_payload(&stress_test(&p.weights, &p.scenarios, p.initial_value)?),
      ComputationParams::OptimizePortfolio(p) => self.optimize(p),
      ComputationParams::RebalancePortfolio(p) => self.rebalance(p),
      ComputationParams::PerformanceAnalysis(p) => self.performance(p),
    }
  }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value> {
  serde_json::to_value(value).map_err(|err| ComputeError::Internal(format!("cannot serialize result: {err}")))
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use serde_json::json;

  use super::*;

  fn run(name: &str, parameters: Value) -> Result<Value> {
    let params = ComputationParams::from_submission(name, parameters)?;
    EngineExecutor::default().execute(&params)
  }

  #[test]
  fn var_cvar_five_point_example() {
    let out = run(
      "var_cvar",
      json!({
        "returns": [[-0.02], [0.01], [-0.015], [0.03], [-0.01]],
        "weights": [1.0],
        "confidence": 0.95,
        "horizon": 1,
        "method": "historical"
      }),
    )
    .unwrap();
    assert_abs_diff_eq!(out["var"].as_f64().unwrap(), 0.019, epsilon = 1e-12);
    assert_abs_diff_eq!(out["cvar"].as_f64().unwrap(), 0.02, epsilon = 1e-12);
    assert_eq!(out["method"], json!("historical"));
  }

  #[test]
  fn monte_carlo_summary_is_seeded() {
    let payload = json!({
      "weights": [0.5, 0.5],
      "mean_returns": [0.0004, 0.0002],
      "covariance": [[0.0001, 0.00001], [0.00001, 0.00005]],
      "num_simulations": 300,
      "horizon": 10,
      "seed": 3
    });
    let a = run("monte_carlo_simulation", payload.clone()).unwrap();
    let b = run("monte_carlo_simulation", payload).unwrap();
    assert_eq!(a, b);
    assert_eq!(a["num_simulations"], json!(300));
  }

  #[test]
  fn stress_optimize_rebalance_and_performance_dispatch() {
    let stress = run(
      "stress_test",
      json!({"weights": [0.6, 0.4], "scenarios": [{"name": "equity_crash", "shocks": [-0.3, 0.015]}]}),
    )
    .unwrap();
    assert_abs_diff_eq!(
      stress["outcomes"][0]["portfolio_return"].as_f64().unwrap(),
      -0.174,
      epsilon = 1e-12
    );

    let opt = run(
      "optimize_portfolio",
      json!({"mean_returns": [0.08, 0.12], "covariance": [[0.04, 0.01], [0.01, 0.09]], "mode": "mean_variance", "target_return": 0.1}),
    )
    .unwrap();
    assert_abs_diff_eq!(opt["expected_return"].as_f64().unwrap(), 0.1, epsilon = 1e-6);

    let plan = run(
      "rebalance_portfolio",
      json!({"current_weights": [0.5, 0.5], "target_weights": [0.3, 0.7]}),
    )
    .unwrap();
    assert_eq!(plan["transactions_required"], json!(2));

    let perf = run(
      "performance_analysis",
      json!({"returns": [[0.01, 0.0], [-0.02, 0.01], [0.015, -0.005], [0.007, 0.002]], "weights": [0.5, 0.5]}),
    )
    .unwrap();
    assert_eq!(perf["periods"], json!(4));
  }

  #[test]
  fn infeasible_target_is_optimization_error() {
    let err = run(
      "optimize_portfolio",
      json!({"mean_returns": [0.08, 0.12], "covariance": [[0.04, 0.01], [0.01, 0.09]], "mode": "mean_variance", "target_return": 0.5}),
    )
    .unwrap_err();
    assert!(matches!(err, ComputeError::Optimization(_)));
  }

  #[test]
  fn frontier_uses_requested_point_count() {
    let out = run(
      "efficient_frontier",
      json!({"mean_returns": [0.08, 0.12], "covariance": [[0.04, 0.01], [0.01, 0.09]], "num_points": 6}),
    )
    .unwrap();
    assert_eq!(out["points"].as_array().unwrap().len(), 6);
    let first = &out["points"][0];
    assert_eq!(first["mode"], json!("mean_variance"));
    assert_eq!(first["converged"], json!(true));
    assert_eq!(first["risk_contributions"].as_array().unwrap().len(), 2);
    assert!(first["objective_value"].as_f64().unwrap() > 0.0);
  }
}
