//! # Monte Carlo Simulation
//!
//! $$
//! V_t = V_{t-1}\left(1 + \mathbf{w}^\top(\mu + L z_t)\right),\qquad z_t \sim \mathcal N(0, I),\ \Sigma = LL^\top
//! $$
//!
//! Forward simulation of a fixed-weight portfolio. Every path draws from its
//! own generator seeded by `(seed, path index)`, so the sequential iterator,
//! a restarted iterator and the parallel collection all agree.

pub mod stress;

use impl_new_derive::ImplNew;
use nalgebra::DMatrix;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::error::ComputeError;
use crate::error::Result;
use crate::quant::linalg;
use crate::quant::returns::validate_weights;
use crate::quant::returns::DEFAULT_WEIGHT_TOLERANCE;
use crate::quant::risk::var;

pub use stress::stress_test;
pub use stress::StressOutcome;
pub use stress::StressScenario;
pub use stress::StressTestReport;

/// Seed used when the caller supplies none.
pub const DEFAULT_SEED: u64 = 42;

/// Inputs of a simulation run.
#[derive(ImplNew, Clone, Debug)]
pub struct SimulationSpec {
  pub weights: Vec<f64>,
  pub mean_returns: Vec<f64>,
  pub covariance: Vec<Vec<f64>>,
  pub num_paths: usize,
  pub horizon: usize,
  pub seed: Option<u64>,
  /// Starting portfolio value, defaults to 1.
  pub initial_value: Option<f64>,
}

/// Prepared simulator: validated inputs and the Cholesky factor.
#[derive(Clone, Debug)]
pub struct MonteCarloEngine {
  drift: f64,
  loadings: DVector<f64>,
  num_paths: usize,
  horizon: usize,
  seed: u64,
  initial_value: f64,
}

impl MonteCarloEngine {
  /// Validate `spec` and factorise its covariance.
  pub fn new(spec: &SimulationSpec) -> Result<Self> {
    let n = spec.mean_returns.len();
    let cov = linalg::covariance_matrix(&spec.covariance, n)?;
    Self::from_moments(
      &DVector::from_column_slice(&spec.mean_returns),
      &cov,
      &spec.weights,
      spec.num_paths,
      spec.horizon,
      spec.seed,
      spec.initial_value,
    )
  }

  /// Build from already-validated moments.
  pub fn from_moments(
    mean: &DVector<f64>,
    cov: &DMatrix<f64>,
    weights: &[f64],
    num_paths: usize,
    horizon: usize,
    seed: Option<u64>,
    initial_value: Option<f64>,
  ) -> Result<Self> {
    let n = mean.len();
    if n == 0 {
      return Err(ComputeError::validation("mean return vector is empty"));
    }
    if weights.len() != n {
      return Err(ComputeError::validation(format!(
        "{} weights supplied for {n} assets",
        weights.len()
      )));
    }
    if cov.nrows() != n || cov.ncols() != n {
      return Err(ComputeError::validation(format!(
        "covariance is {}x{}, expected {n}x{n}",
        cov.nrows(),
        cov.ncols()
      )));
    }
    if mean.iter().any(|m| !m.is_finite()) {
      return Err(ComputeError::validation("mean returns must be finite"));
    }
    validate_weights(weights, DEFAULT_WEIGHT_TOLERANCE)?;
    if num_paths == 0 {
      return Err(ComputeError::validation("number of simulations must be positive"));
    }
    if horizon == 0 {
      return Err(ComputeError::validation("horizon must be positive"));
    }
    let initial_value = initial_value.unwrap_or(1.0);
    if !(initial_value.is_finite() && initial_value > 0.0) {
      return Err(ComputeError::validation(format!(
        "initial value must be positive, got {initial_value}"
      )));
    }

    let chol = linalg::cholesky_lower(cov)?;
    let w = DVector::from_column_slice(weights);

    // wᵀ(μ + Lz) = wᵀμ + (Lᵀw)ᵀz
    Ok(Self {
      drift: w.dot(mean),
      loadings: chol.transpose() * &w,
      num_paths,
      horizon,
      seed: seed.unwrap_or(DEFAULT_SEED),
      initial_value,
    })
  }

  pub fn num_paths(&self) -> usize {
    self.num_paths
  }

  pub fn horizon(&self) -> usize {
    self.horizon
  }

  pub fn seed(&self) -> u64 {
    self.seed
  }

  pub fn initial_value(&self) -> f64 {
    self.initial_value
  }

  fn path_rng(&self, index: usize) -> StdRng {
    StdRng::seed_from_u64(splitmix64(self.seed ^ splitmix64(index as u64)))
  }

  fn period_return(&self, rng: &mut StdRng) -> f64 {
    let shock: f64 = self
      .loadings
      .iter()
      .map(|l| l * rng.sample::<f64, _>(StandardNormal))
      .sum();
    self.drift + shock
  }

  /// Portfolio value after each of the `horizon` periods of path `index`.
  pub fn path(&self, index: usize) -> Vec<f64> {
    let mut rng = self.path_rng(index);
    let mut value = self.initial_value;
    (0..self.horizon)
      .map(|_| {
        value *= 1.0 + self.period_return(&mut rng);
        value
      })
      .collect()
  }

  /// Terminal value of path `index`.
  pub fn terminal_value(&self, index: usize) -> f64 {
    let mut rng = self.path_rng(index);
    (0..self.horizon).fold(self.initial_value, |value, _| {
      value * (1.0 + self.period_return(&mut rng))
    })
  }

  /// Lazy sequence of all terminal values; call again to restart.
  pub fn terminal_values(&self) -> TerminalValues<'_> {
    TerminalValues {
      engine: self,
      next: 0,
    }
  }

  /// Lazy sequence of full paths.
  pub fn paths(&self) -> impl Iterator<Item = Vec<f64>> + '_ {
    (0..self.num_paths).map(move |i| self.path(i))
  }

  /// All terminal values computed on the rayon pool, in path order.
  pub fn terminal_values_par(&self) -> Vec<f64> {
    (0..self.num_paths)
      .into_par_iter()
      .map(|i| self.terminal_value(i))
      .collect()
  }

  /// Distribution summary of the simulated terminal values.
  pub fn summarize(&self, confidence: f64) -> Result<SimulationSummary> {
    var::check_confidence(confidence)?;

    let mut terminal = self.terminal_values_par();
    let returns: Vec<f64> = terminal.iter().map(|v| v / self.initial_value - 1.0).collect();
    let tail = var::empirical_tail(&returns, confidence)?;

    terminal.sort_by(f64::total_cmp);
    let n = terminal.len() as f64;
    let mean = terminal.iter().sum::<f64>() / n;
    let std = if terminal.len() > 1 {
      (terminal.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
      0.0
    };
    let losses = terminal.iter().filter(|v| **v < self.initial_value).count();

    debug!(
      paths = self.num_paths,
      horizon = self.horizon,
      seed = self.seed,
      var = tail.var,
      "monte carlo simulation summarized"
    );

    Ok(SimulationSummary {
      num_simulations: self.num_paths,
      horizon: self.horizon,
      seed: self.seed,
      initial_value: self.initial_value,
      mean_terminal_value: mean,
      std_terminal_value: std,
      percentile_5: var::percentile(&terminal, 0.05),
      median: var::percentile(&terminal, 0.5),
      percentile_95: var::percentile(&terminal, 0.95),
      confidence,
      var: tail.var,
      cvar: tail.cvar,
      probability_of_loss: losses as f64 / n,
    })
  }
}

/// Finite, restartable iterator over simulated terminal values.
#[derive(Clone, Debug)]
pub struct TerminalValues<'a> {
  engine: &'a MonteCarloEngine,
  next: usize,
}

impl Iterator for TerminalValues<'_> {
  type Item = f64;

  fn next(&mut self) -> Option<f64> {
    if self.next >= self.engine.num_paths {
      return None;
    }
    let value = self.engine.terminal_value(self.next);
    self.next += 1;
    Some(value)
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    let left = self.engine.num_paths - self.next;
    (left, Some(left))
  }
}

impl ExactSizeIterator for TerminalValues<'_> {}

/// Summary statistics of a simulation run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulationSummary {
  pub num_simulations: usize,
  pub horizon: usize,
  pub seed: u64,
  pub initial_value: f64,
  pub mean_terminal_value: f64,
  pub std_terminal_value: f64,
  pub percentile_5: f64,
  pub median: f64,
  pub percentile_95: f64,
  pub confidence: f64,
  /// Loss fraction of the simulated horizon return.
  pub var: f64,
  pub cvar: f64,
  pub probability_of_loss: f64,
}

fn splitmix64(x: u64) -> u64 {
  let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
  z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
  z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
  z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;

  fn spec(seed: Option<u64>) -> SimulationSpec {
    SimulationSpec::new(
      vec![0.6, 0.4],
      vec![0.0005, 0.0002],
      vec![vec![0.0001, 0.00002], vec![0.00002, 0.00004]],
      500,
      20,
      seed,
      Some(100.0),
    )
  }

  #[test]
  fn fixed_seed_reproduces_sequence() {
    let a = MonteCarloEngine::new(&spec(Some(7))).unwrap();
    let b = MonteCarloEngine::new(&spec(Some(7))).unwrap();

    let xs: Vec<f64> = a.terminal_values().collect();
    let ys: Vec<f64> = b.terminal_values().collect();
    assert_eq!(xs, ys);

    let paths_a: Vec<Vec<f64>> = a.paths().take(3).collect();
    let paths_b: Vec<Vec<f64>> = b.paths().take(3).collect();
    assert_eq!(paths_a, paths_b);
  }

  #[test]
  fn iterator_restarts_and_matches_parallel_collection() {
    let engine = MonteCarloEngine::new(&spec(Some(3))).unwrap();
    let first: Vec<f64> = engine.terminal_values().collect();
    let second: Vec<f64> = engine.terminal_values().collect();

    assert_eq!(first.len(), 500);
    assert_eq!(engine.terminal_values().len(), 500);
    assert_eq!(first, second);
    assert_eq!(first, engine.terminal_values_par());
  }

  #[test]
  fn different_seeds_differ() {
    let a = MonteCarloEngine::new(&spec(Some(1))).unwrap();
    let b = MonteCarloEngine::new(&spec(Some(2))).unwrap();
    assert_ne!(a.terminal_value(0), b.terminal_value(0));
  }

  #[test]
  fn path_ends_at_terminal_value() {
    let engine = MonteCarloEngine::new(&spec(None)).unwrap();
    let path = engine.path(17);
    assert_eq!(path.len(), 20);
    assert_abs_diff_eq!(*path.last().unwrap(), engine.terminal_value(17), epsilon = 1e-12);
  }

  #[test]
  fn zero_volatility_compounds_drift() {
    let engine = MonteCarloEngine::new(&SimulationSpec::new(
      vec![1.0],
      vec![0.01],
      vec![vec![0.0]],
      4,
      10,
      Some(5),
      None,
    ))
    .unwrap();

    for v in engine.terminal_values() {
      assert_abs_diff_eq!(v, 1.01f64.powi(10), epsilon = 1e-9);
    }
  }

  #[test]
  fn summary_is_consistent() {
    let engine = MonteCarloEngine::new(&spec(Some(21))).unwrap();
    let summary = engine.summarize(0.95).unwrap();

    assert_eq!(summary.num_simulations, 500);
    assert!(summary.percentile_5 <= summary.median);
    assert!(summary.median <= summary.percentile_95);
    assert!(summary.cvar >= summary.var);
    assert!((0.0..=1.0).contains(&summary.probability_of_loss));
  }

  #[test]
  fn indefinite_covariance_is_numerical_error() {
    let bad = SimulationSpec::new(
      vec![0.5, 0.5],
      vec![0.0, 0.0],
      vec![vec![0.01, 0.05], vec![0.05, 0.01]],
      10,
      5,
      None,
      None,
    );
    assert!(matches!(
      MonteCarloEngine::new(&bad),
      Err(ComputeError::Numerical(_))
    ));
  }

  #[test]
  fn rejects_dimension_mismatch() {
    let bad = SimulationSpec::new(
      vec![1.0],
      vec![0.0, 0.0],
      vec![vec![0.01, 0.0], vec![0.0, 0.01]],
      10,
      5,
      None,
      None,
    );
    assert!(matches!(
      MonteCarloEngine::new(&bad),
      Err(ComputeError::Validation(_))
    ));
  }
}
