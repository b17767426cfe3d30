//! # Linear Algebra
//!
//! $$
//! \Sigma = L L^\top
//! $$
//!
//! Covariance validation and factorisation shared by the simulator and the optimizers.

use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray::Array2;

use crate::error::ComputeError;
use crate::error::Result;

const SYMMETRY_TOL: f64 = 1e-9;
const PSD_TOL: f64 = 1e-10;

/// Validate a square, symmetric, finite covariance of dimension `n` and convert it.
pub fn covariance_matrix(cov: &[Vec<f64>], n: usize) -> Result<DMatrix<f64>> {
  if cov.len() != n {
    return Err(ComputeError::validation(format!(
      "covariance matrix has {} rows, expected {n}",
      cov.len()
    )));
  }
  if let Some(i) = cov.iter().position(|row| row.len() != n) {
    return Err(ComputeError::validation(format!(
      "covariance row {i} has {} entries, expected {n}",
      cov[i].len()
    )));
  }

  let m = DMatrix::from_fn(n, n, |i, j| cov[i][j]);
  check_covariance(&m)?;
  Ok(m)
}

/// Convert an ndarray covariance estimate.
pub fn from_array(cov: &Array2<f64>) -> Result<DMatrix<f64>> {
  let (rows, cols) = cov.dim();
  if rows != cols {
    return Err(ComputeError::validation(format!(
      "covariance matrix is {rows}x{cols}, expected square"
    )));
  }
  let m = DMatrix::from_fn(rows, cols, |i, j| cov[[i, j]]);
  check_covariance(&m)?;
  Ok(m)
}

fn check_covariance(m: &DMatrix<f64>) -> Result<()> {
  let n = m.nrows();
  for i in 0..n {
    if !m[(i, i)].is_finite() {
      return Err(ComputeError::validation(format!(
        "covariance diagonal entry {i} is non-finite"
      )));
    }
    if m[(i, i)] < 0.0 {
      return Err(ComputeError::numerical(format!(
        "covariance matrix is not positive semi-definite: variance {i} is {}",
        m[(i, i)]
      )));
    }
    for j in (i + 1)..n {
      let (a, b) = (m[(i, j)], m[(j, i)]);
      if !a.is_finite() || !b.is_finite() {
        return Err(ComputeError::validation(format!(
          "covariance entry ({i}, {j}) is non-finite"
        )));
      }
      let scale = a.abs().max(b.abs()).max(1.0);
      if (a - b).abs() > SYMMETRY_TOL * scale {
        return Err(ComputeError::validation(format!(
          "covariance matrix is not symmetric at ({i}, {j})"
        )));
      }
    }
  }
  Ok(())
}

/// Lower Cholesky factor of a positive semi-definite covariance.
///
/// Singular but PSD matrices get a small diagonal jitter; indefinite matrices are rejected.
pub fn cholesky_lower(cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
  if let Some(chol) = cov.clone().cholesky() {
    return Ok(chol.l());
  }

  let n = cov.nrows();
  let scale = (0..n).map(|i| cov[(i, i)]).fold(0.0_f64, f64::max).max(1e-12);
  let eigen = cov.clone().symmetric_eigen();
  let min_eig = eigen.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);

  if min_eig < -PSD_TOL * scale {
    return Err(ComputeError::numerical(format!(
      "covariance matrix is not positive semi-definite (min eigenvalue {min_eig:.3e})"
    )));
  }

  let jitter = scale * 1e-10 - min_eig.min(0.0);
  let mut shifted = cov.clone();
  for i in 0..n {
    shifted[(i, i)] += jitter;
  }

  shifted
    .cholesky()
    .map(|chol| chol.l())
    .ok_or_else(|| ComputeError::numerical("Cholesky factorisation of covariance matrix failed"))
}

/// `wᵀ Σ w`.
pub fn quad_form(cov: &DMatrix<f64>, w: &DVector<f64>) -> f64 {
  w.dot(&(cov * w))
}

/// Per-asset share of portfolio variance, `w_i (Σw)_i / wᵀΣw`.
pub fn risk_contributions(cov: &DMatrix<f64>, w: &DVector<f64>) -> Vec<f64> {
  let sigma_w = cov * w;
  let total = w.dot(&sigma_w);
  if total <= 0.0 {
    return vec![0.0; w.len()];
  }
  w.iter()
    .zip(sigma_w.iter())
    .map(|(wi, swi)| wi * swi / total)
    .collect()
}
