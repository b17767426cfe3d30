//! # Active-Set Quadratic Program
//!
//! $$
//! \min_{\mathbf{w}} \tfrac12\mathbf{w}^\top\Sigma\mathbf{w}
//! \quad\text{s.t.}\quad A\mathbf{w}=\mathbf{b},\ l\le\mathbf{w}\le u
//! $$
//!
//! Primal active-set method. The budget row `1ᵀw = 1` and, when requested,
//! the return row `μᵀw = r*` are always active; box bounds enter and leave
//! the working set one at a time.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::trace;

use crate::error::ComputeError;
use crate::error::Result;

const STEP_TOL: f64 = 1e-12;
const DIRECTION_TOL: f64 = 1e-10;
const FEASIBILITY_TOL: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bound {
  Free,
  Lower,
  Upper,
  /// `l_i == u_i`; never released.
  Fixed,
}

/// Solution of [`min_variance`].
#[derive(Clone, Debug)]
pub(crate) struct QpSolution {
  pub weights: DVector<f64>,
  pub iterations: usize,
}

/// Lowest and highest `μᵀw` reachable under the budget and box constraints.
pub(crate) fn return_range(mu: &DVector<f64>, lower: &[f64], upper: &[f64]) -> Result<(f64, f64)> {
  check_budget(lower, upper)?;
  let (lo, _) = extreme_portfolio(mu, lower, upper, false);
  let (hi, _) = extreme_portfolio(mu, lower, upper, true);
  Ok((lo, hi))
}

fn check_budget(lower: &[f64], upper: &[f64]) -> Result<()> {
  let sum_lo: f64 = lower.iter().sum();
  let sum_hi: f64 = upper.iter().sum();
  if sum_lo > 1.0 + FEASIBILITY_TOL || sum_hi < 1.0 - FEASIBILITY_TOL {
    return Err(ComputeError::optimization(format!(
      "weight bounds are infeasible: lower bounds sum to {sum_lo:.6}, upper bounds to {sum_hi:.6}"
    )));
  }
  Ok(())
}

/// Greedy fill from the lower bounds toward the best (or worst) returning assets.
fn extreme_portfolio(mu: &DVector<f64>, lower: &[f64], upper: &[f64], maximize: bool) -> (f64, DVector<f64>) {
  let mut order: Vec<usize> = (0..mu.len()).collect();
  if maximize {
    order.sort_by(|&a, &b| mu[b].total_cmp(&mu[a]));
  } else {
    order.sort_by(|&a, &b| mu[a].total_cmp(&mu[b]));
  }

  let mut w = DVector::from_column_slice(lower);
  let mut remaining = 1.0 - lower.iter().sum::<f64>();
  for i in order {
    if remaining <= 0.0 {
      break;
    }
    let add = (upper[i] - lower[i]).min(remaining);
    w[i] += add;
    remaining -= add;
  }

  (mu.dot(&w), w)
}

/// Minimum-variance weights, optionally constrained to `μᵀw = target`.
pub(crate) fn min_variance(
  cov: &DMatrix<f64>,
  mu: &DVector<f64>,
  lower: &[f64],
  upper: &[f64],
  target: Option<f64>,
) -> Result<QpSolution> {
  let n = mu.len();
  check_budget(lower, upper)?;

  let (r_min, w_min) = extreme_portfolio(mu, lower, upper, false);
  let (r_max, w_max) = extreme_portfolio(mu, lower, upper, true);
  let spread = r_max - r_min;
  let scale = 1.0 + r_min.abs().max(r_max.abs());
  let w_mid = centered_portfolio(lower, upper);

  let mut rows: Vec<DVector<f64>> = vec![DVector::from_element(n, 1.0)];
  let mut w = match target {
    Some(t) => {
      if !t.is_finite() {
        return Err(ComputeError::validation("target return must be finite"));
      }
      if t > r_max + FEASIBILITY_TOL * scale || t < r_min - FEASIBILITY_TOL * scale {
        return Err(ComputeError::optimization(format!(
          "target return {t:.6} is outside the achievable range [{r_min:.6}, {r_max:.6}]"
        )));
      }
      if spread > STEP_TOL * scale {
        rows.push(mu.clone());
        start_on_target(mu, t, (r_min, &w_min), &w_mid, (r_max, &w_max), scale)
      } else {
        w_min
      }
    }
    None => w_mid,
  };

  // Newton steps and multiplier signs are invariant to a positive rescaling of Σ.
  let sigma_scale = cov.diagonal().amax();
  let cov = if sigma_scale > 0.0 { cov / sigma_scale } else { cov.clone() };

  let mut state: Vec<Bound> = lower
    .iter()
    .zip(upper)
    .map(|(l, u)| if u - l <= STEP_TOL { Bound::Fixed } else { Bound::Free })
    .collect();
  // Bounds added by a zero-length step after a release; not released again until progress is made.
  let mut frozen = vec![false; n];
  let mut degenerate = false;
  let mut at_subspace_minimum = false;

  let max_iter = 100 + 50 * n;
  for iter in 1..=max_iter {
    let bound_idx: Vec<usize> = (0..n).filter(|&i| state[i] != Bound::Free).collect();
    let m = rows.len();
    let k = n + m + bound_idx.len();

    // [Σ  -Cᵀ; C  0] [p; λ] = [-Σw; 0], C = equality rows stacked over the working bounds.
    let mut kkt = DMatrix::<f64>::zeros(k, k);
    kkt.view_mut((0, 0), (n, n)).copy_from(&cov);
    for (r, row) in rows.iter().enumerate() {
      for j in 0..n {
        kkt[(n + r, j)] = row[j];
        kkt[(j, n + r)] = -row[j];
      }
    }
    for (r, &i) in bound_idx.iter().enumerate() {
      kkt[(n + m + r, i)] = 1.0;
      kkt[(i, n + m + r)] = -1.0;
    }

    let g = &cov * &w;
    let mut rhs = DVector::<f64>::zeros(k);
    rhs.rows_mut(0, n).copy_from(&(-&g));

    let svd = kkt.svd(true, true);
    let eps = svd.singular_values.max() * 1e-13;
    let sol = svd
      .solve(&rhs, eps)
      .map_err(|err| ComputeError::numerical(format!("KKT system solve failed: {err}")))?;
    let p = sol.rows(0, n).into_owned();
    let p_norm = p.amax();

    if at_subspace_minimum || p_norm <= DIRECTION_TOL {
      at_subspace_minimum = false;
      let g_scale = 1e-10 * (1.0 + g.amax());
      let mut release: Option<(usize, f64)> = None;
      for (r, &i) in bound_idx.iter().enumerate() {
        if frozen[i] {
          continue;
        }
        let nu = sol[n + m + r];
        let violation = match state[i] {
          Bound::Lower => -nu,
          Bound::Upper => nu,
          _ => continue,
        };
        if violation <= g_scale {
          continue;
        }
        // Bland's rule while degenerate: the smallest index wins.
        let better = match release {
          None => true,
          Some((_, v)) => !degenerate && violation > v,
        };
        if better {
          release = Some((i, violation));
        }
      }

      match release {
        Some((i, _)) => {
          trace!(asset = i, iter, degenerate, "releasing bound");
          state[i] = Bound::Free;
          degenerate = true;
        }
        None => {
          for i in 0..n {
            w[i] = w[i].clamp(lower[i], upper[i]);
          }
          return Ok(QpSolution {
            weights: w,
            iterations: iter,
          });
        }
      }
      continue;
    }

    // Ratio test. Directions below `dir_tol` are treated as zero; ties go to the smallest index.
    let dir_tol = 1e-9 * p_norm;
    let limits: Vec<Option<(f64, Bound)>> = (0..n)
      .map(|i| {
        if state[i] != Bound::Free {
          None
        } else if p[i] < -dir_tol {
          Some((((lower[i] - w[i]) / p[i]).max(0.0), Bound::Lower))
        } else if p[i] > dir_tol {
          Some((((upper[i] - w[i]) / p[i]).max(0.0), Bound::Upper))
        } else {
          None
        }
      })
      .collect();
    let alpha = limits.iter().flatten().map(|(a, _)| *a).fold(1.0, f64::min);
    let blocking = if alpha < 1.0 {
      limits
        .iter()
        .enumerate()
        .find_map(|(i, l)| (*l).filter(|(a, _)| *a <= alpha + STEP_TOL).map(|(_, side)| (i, side)))
    } else {
      None
    };

    w += &p * alpha;
    let progressed = alpha * p_norm > STEP_TOL;
    if progressed {
      degenerate = false;
      frozen.iter_mut().for_each(|f| *f = false);
    }

    match blocking {
      Some((i, side)) => {
        w[i] = if side == Bound::Lower { lower[i] } else { upper[i] };
        state[i] = side;
        if degenerate {
          frozen[i] = true;
        }
      }
      None => at_subspace_minimum = true,
    }
  }

  Err(ComputeError::numerical(format!(
    "active-set solver did not converge within {max_iter} iterations"
  )))
}

/// Lower bounds plus the remaining budget spread in proportion to each asset's room,
/// so every asset with `l_i < u_i` sits strictly inside its box when the budget allows.
fn centered_portfolio(lower: &[f64], upper: &[f64]) -> DVector<f64> {
  let n = lower.len();
  let lo = DVector::from_column_slice(lower);
  let room: f64 = upper.iter().zip(lower).map(|(u, l)| u - l).sum();
  if room <= 0.0 {
    return lo;
  }
  let slack = 1.0 - lower.iter().sum::<f64>();
  let width = DVector::from_iterator(n, upper.iter().zip(lower).map(|(u, l)| u - l));
  lo + width * (slack / room)
}

/// Feasible start on `μᵀw = t`, interpolated between the centered portfolio and
/// the extreme portfolio on the same side of it.
fn start_on_target(
  mu: &DVector<f64>,
  t: f64,
  (r_min, w_min): (f64, &DVector<f64>),
  w_mid: &DVector<f64>,
  (r_max, w_max): (f64, &DVector<f64>),
  scale: f64,
) -> DVector<f64> {
  let r_mid = mu.dot(w_mid);
  let (r_a, w_a, r_b, w_b) = if t <= r_mid { (r_min, w_min, r_mid, w_mid) } else { (r_mid, w_mid, r_max, w_max) };
  if r_b - r_a <= STEP_TOL * scale {
    // The centered portfolio coincides with an extreme in return; fall back to the full segment.
    let lambda = ((t - r_min) / (r_max - r_min)).clamp(0.0, 1.0);
    return w_min * (1.0 - lambda) + w_max * lambda;
  }
  let lambda = ((t - r_a) / (r_b - r_a)).clamp(0.0, 1.0);
  w_a * (1.0 - lambda) + w_b * lambda
}
