//! # Value at Risk
//!
//! $$
//! \operatorname{VaR}_c = -Q_{1-c}(R)\sqrt{h},\qquad
//! \operatorname{CVaR}_c = -\mathbb E\left[R \mid R \le Q_{1-c}(R)\right]\sqrt{h}
//! $$
//!
//! Losses are reported as positive numbers. Empirical quantiles use linear
//! interpolation between closest ranks (`rank = q (n - 1)`).

use serde::Serialize;
use statrs::distribution::Continuous;
use statrs::distribution::ContinuousCDF;
use statrs::distribution::Normal;

use crate::error::ComputeError;
use crate::error::Result;

/// VaR/CVaR pair with the return threshold it was read from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TailEstimate {
  /// Loss not exceeded with probability `confidence`.
  pub var: f64,
  /// Mean loss beyond the VaR threshold.
  pub cvar: f64,
  /// Return quantile at `1 - confidence` (before horizon scaling).
  pub threshold: f64,
}

pub(crate) fn check_confidence(confidence: f64) -> Result<()> {
  if confidence.is_finite() && confidence > 0.0 && confidence < 1.0 {
    Ok(())
  } else {
    Err(ComputeError::validation(format!(
      "confidence must be in (0, 1), got {confidence}"
    )))
  }
}

pub(crate) fn check_horizon(horizon: i64) -> Result<usize> {
  if horizon <= 0 {
    return Err(ComputeError::validation(format!(
      "horizon must be a positive number of periods, got {horizon}"
    )));
  }
  usize::try_from(horizon)
    .map_err(|_| ComputeError::validation(format!("horizon {horizon} is too large")))
}

/// Linear-interpolated quantile of an ascending sample.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
  match sorted.len() {
    0 => f64::NAN,
    1 => sorted[0],
    n => {
      let rank = q.clamp(0.0, 1.0) * (n - 1) as f64;
      let lo = rank.floor() as usize;
      let hi = (lo + 1).min(n - 1);
      let frac = rank - lo as f64;
      sorted[lo] + frac * (sorted[hi] - sorted[lo])
    }
  }
}

/// Tail estimate of a return sample without horizon scaling.
pub fn empirical_tail(returns: &[f64], confidence: f64) -> Result<TailEstimate> {
  check_confidence(confidence)?;
  if returns.is_empty() {
    return Err(ComputeError::validation("return sample is empty"));
  }

  let mut sorted = returns.to_vec();
  sorted.sort_by(f64::total_cmp);

  let threshold = percentile(&sorted, 1.0 - confidence);
  let tail: Vec<f64> = sorted.iter().copied().take_while(|r| *r <= threshold).collect();
  // the minimum is always at or below an interpolated quantile
  let tail_mean = tail.iter().sum::<f64>() / tail.len().max(1) as f64;

  Ok(TailEstimate {
    var: -threshold,
    cvar: -tail_mean,
    threshold,
  })
}

/// Historical simulation VaR, scaled by `sqrt(horizon)`.
pub fn historical_var(returns: &[f64], confidence: f64, horizon: usize) -> Result<TailEstimate> {
  let tail = empirical_tail(returns, confidence)?;
  let scale = (horizon.max(1) as f64).sqrt();

  Ok(TailEstimate {
    var: tail.var * scale,
    cvar: tail.cvar * scale,
    threshold: tail.threshold,
  })
}

/// Variance-covariance VaR under normal returns.
pub fn parametric_var(mean: f64, std_dev: f64, confidence: f64, horizon: usize) -> Result<TailEstimate> {
  check_confidence(confidence)?;
  if !(mean.is_finite() && std_dev.is_finite() && std_dev >= 0.0) {
    return Err(ComputeError::numerical(format!(
      "invalid moments for parametric VaR: mean {mean}, std {std_dev}"
    )));
  }

  let std_normal = Normal::new(0.0, 1.0)
    .map_err(|err| ComputeError::numerical(format!("standard normal construction: {err}")))?;
  let alpha = 1.0 - confidence;
  let z = std_normal.inverse_cdf(alpha);

  let h = horizon.max(1) as f64;
  let mu_h = mean * h;
  let sigma_h = std_dev * h.sqrt();
  let threshold = mu_h + z * sigma_h;

  Ok(TailEstimate {
    var: -threshold,
    cvar: -(mu_h - sigma_h * std_normal.pdf(z) / alpha),
    threshold,
  })
}
