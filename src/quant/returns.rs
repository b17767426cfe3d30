//! # Return Series
//!
//! $$
//! r_{t,i} = \frac{P_{t,i}}{P_{t-1,i}} - 1,\qquad r^{p}_t = \sum_i w_i r_{t,i}
//! $$
//!
//! Aligned `periods × assets` return matrix shared by every calculator, and the
//! [`Portfolio`] value type.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::ArrayView2;
use ndarray::Axis;
use ndarray_stats::CorrelationExt;
use serde::Serialize;

use crate::error::ComputeError;
use crate::error::Result;

/// Default tolerance on `|sum(w) - 1|`.
pub const DEFAULT_WEIGHT_TOLERANCE: f64 = 1e-6;

/// Immutable matrix of period returns, one column per asset.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnSeries {
  data: Array2<f64>,
}

impl ReturnSeries {
  /// Build from period rows (`rows[t][i]` is the return of asset `i` in period `t`).
  pub fn new(rows: &[Vec<f64>]) -> Result<Self> {
    let Some(first) = rows.first() else {
      return Err(ComputeError::validation("return series is empty"));
    };

    let n_assets = first.len();
    if n_assets == 0 {
      return Err(ComputeError::validation("return series has no assets"));
    }

    for (t, row) in rows.iter().enumerate() {
      if row.len() != n_assets {
        return Err(ComputeError::validation(format!(
          "period {t} has {} returns, expected {n_assets}",
          row.len()
        )));
      }
      if let Some(i) = row.iter().position(|r| !r.is_finite()) {
        return Err(ComputeError::validation(format!(
          "non-finite return for asset {i} in period {t}"
        )));
      }
    }

    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    let data = Array2::from_shape_vec((rows.len(), n_assets), flat)
      .map_err(|err| ComputeError::validation(err.to_string()))?;

    Ok(Self { data })
  }

  /// Single-asset series.
  pub fn from_single(returns: &[f64]) -> Result<Self> {
    let rows: Vec<Vec<f64>> = returns.iter().map(|&r| vec![r]).collect();
    Self::new(&rows)
  }

  /// Simple returns from per-asset price histories, aligned to their common tail.
  pub fn from_prices(prices: &[Vec<f64>]) -> Result<Self> {
    if prices.is_empty() {
      return Err(ComputeError::validation("no price histories supplied"));
    }

    let mut per_asset = Vec::with_capacity(prices.len());
    for (i, closes) in prices.iter().enumerate() {
      if closes.iter().any(|&p| !(p.is_finite() && p > 0.0)) {
        return Err(ComputeError::validation(format!(
          "asset {i} has a non-positive or non-finite price"
        )));
      }
      per_asset.push(simple_returns(closes));
    }

    let aligned = align_tails(&per_asset);
    let n_periods = aligned.first().map(|r| r.len()).unwrap_or(0);
    let rows: Vec<Vec<f64>> = (0..n_periods)
      .map(|t| aligned.iter().map(|r| r[t]).collect())
      .collect();

    Self::new(&rows)
  }

  pub fn n_periods(&self) -> usize {
    self.data.nrows()
  }

  pub fn n_assets(&self) -> usize {
    self.data.ncols()
  }

  pub fn view(&self) -> ArrayView2<'_, f64> {
    self.data.view()
  }

  /// Returns of a single asset.
  pub fn asset(&self, i: usize) -> ArrayView1<'_, f64> {
    self.data.column(i)
  }

  /// Per-asset sample mean.
  pub fn mean_returns(&self) -> Array1<f64> {
    self
      .data
      .mean_axis(Axis(0))
      .unwrap_or_else(|| Array1::zeros(self.n_assets()))
  }

  /// Sample covariance across assets (`ddof = 1`).
  pub fn covariance(&self) -> Result<Array2<f64>> {
    if self.n_periods() < 2 {
      return Err(ComputeError::validation(
        "at least two periods are required for a covariance estimate",
      ));
    }

    self
      .data
      .t()
      .cov(1.0)
      .map_err(|err| ComputeError::numerical(format!("covariance estimate failed: {err}")))
  }

  /// Portfolio-weighted aggregate series.
  pub fn portfolio_returns(&self, weights: &[f64]) -> Result<Array1<f64>> {
    if weights.len() != self.n_assets() {
      return Err(ComputeError::validation(format!(
        "{} weights supplied for {} assets",
        weights.len(),
        self.n_assets()
      )));
    }

    Ok(self.data.dot(&ArrayView1::from(weights)))
  }
}

fn simple_returns(closes: &[f64]) -> Vec<f64> {
  closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect()
}

fn align_tails(all_returns: &[Vec<f64>]) -> Vec<Vec<f64>> {
  let min_len = all_returns.iter().map(|r| r.len()).min().unwrap_or(0);
  all_returns
    .iter()
    .map(|r| r[r.len() - min_len..].to_vec())
    .collect()
}

/// One `(asset, weight)` pair.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Holding {
  pub asset_id: String,
  pub weight: f64,
}

/// Long-only fully invested allocation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Portfolio {
  holdings: Vec<Holding>,
}

impl Portfolio {
  /// Validated constructor; weights must be non-negative and sum to one within `tolerance`.
  pub fn new(asset_ids: Vec<String>, weights: Vec<f64>, tolerance: f64) -> Result<Self> {
    if asset_ids.len() != weights.len() {
      return Err(ComputeError::validation(format!(
        "{} asset ids supplied for {} weights",
        asset_ids.len(),
        weights.len()
      )));
    }
    validate_weights(&weights, tolerance)?;

    let holdings = asset_ids
      .into_iter()
      .zip(weights)
      .map(|(asset_id, weight)| Holding { asset_id, weight })
      .collect();

    Ok(Self { holdings })
  }

  /// Portfolio with generated `asset_{i}` identifiers.
  pub fn from_weights(weights: &[f64], tolerance: f64) -> Result<Self> {
    Self::new(default_asset_ids(weights.len()), weights.to_vec(), tolerance)
  }

  pub fn holdings(&self) -> &[Holding] {
    &self.holdings
  }

  pub fn weights(&self) -> Vec<f64> {
    self.holdings.iter().map(|h| h.weight).collect()
  }

  pub fn asset_ids(&self) -> impl Iterator<Item = &str> {
    self.holdings.iter().map(|h| h.asset_id.as_str())
  }

  pub fn len(&self) -> usize {
    self.holdings.len()
  }

  pub fn is_empty(&self) -> bool {
    self.holdings.is_empty()
  }
}

/// `asset_0`, `asset_1`, ...
pub fn default_asset_ids(n: usize) -> Vec<String> {
  (0..n).map(|i| format!("asset_{i}")).collect()
}

/// Check the portfolio weight invariant.
pub fn validate_weights(weights: &[f64], tolerance: f64) -> Result<()> {
  if weights.is_empty() {
    return Err(ComputeError::validation("portfolio has no weights"));
  }
  if let Some(i) = weights.iter().position(|w| !w.is_finite() || *w < 0.0) {
    return Err(ComputeError::validation(format!(
      "weight {i} is negative or non-finite: {}",
      weights[i]
    )));
  }

  let total: f64 = weights.iter().sum();
  if (total - 1.0).abs() > tolerance {
    return Err(ComputeError::validation(format!(
      "weights sum to {total}, expected 1 within {tolerance:e}"
    )));
  }

  Ok(())
}
