//! # Rebalancing
//!
//! $$
//! \Delta_i = w_i^{\mathrm{target}} - w_i^{\mathrm{current}},\qquad
//! \mathrm{turnover} = \tfrac12\sum_i |\Delta_i|
//! $$
//!
//! Per-asset weight deltas between a current and a target portfolio.

use serde::Serialize;

use crate::error::ComputeError;
use crate::error::Result;
use crate::quant::returns::default_asset_ids;
use crate::quant::returns::Portfolio;

/// Default |delta| above which a trade is flagged.
pub const DEFAULT_REBALANCE_THRESHOLD: f64 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
  Buy,
  Sell,
  Hold,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RebalanceTrade {
  pub asset_id: String,
  pub current_weight: f64,
  pub target_weight: f64,
  pub delta: f64,
  pub action: TradeAction,
  pub requires_transaction: bool,
  /// `delta * portfolio_value`, when a value is supplied.
  pub trade_value: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RebalancePlan {
  pub threshold: f64,
  pub trades: Vec<RebalanceTrade>,
  pub turnover: f64,
  pub transactions_required: usize,
  /// The target portfolio; the current one is left untouched.
  pub rebalanced: Portfolio,
}

impl RebalancePlan {
  /// Trades flagged for execution.
  pub fn transactions(&self) -> impl Iterator<Item = &RebalanceTrade> {
    self.trades.iter().filter(|t| t.requires_transaction)
  }
}

pub(crate) fn check_trade_inputs(threshold: f64, portfolio_value: Option<f64>) -> Result<()> {
  if !(threshold.is_finite() && threshold >= 0.0) {
    return Err(ComputeError::validation(format!(
      "rebalance threshold must be non-negative, got {threshold}"
    )));
  }
  if let Some(value) = portfolio_value {
    if !(value.is_finite() && value > 0.0) {
      return Err(ComputeError::validation(format!(
        "portfolio value must be positive, got {value}"
      )));
    }
  }
  Ok(())
}

/// Derive the rebalancing plan from `current` to `target`.
pub fn rebalance(
  current: &Portfolio,
  target: &Portfolio,
  threshold: f64,
  portfolio_value: Option<f64>,
) -> Result<RebalancePlan> {
  if current.len() != target.len() {
    return Err(ComputeError::validation(format!(
      "current portfolio has {} assets, target has {}",
      current.len(),
      target.len()
    )));
  }
  check_trade_inputs(threshold, portfolio_value)?;

  let trades: Vec<RebalanceTrade> = current
    .holdings()
    .iter()
    .zip(target.holdings())
    .map(|(cur, tgt)| {
      let delta = tgt.weight - cur.weight;
      let requires_transaction = delta.abs() > threshold;
      let action = match (requires_transaction, delta > 0.0) {
        (false, _) => TradeAction::Hold,
        (true, true) => TradeAction::Buy,
        (true, false) => TradeAction::Sell,
      };
      RebalanceTrade {
        asset_id: tgt.asset_id.clone(),
        current_weight: cur.weight,
        target_weight: tgt.weight,
        delta,
        action,
        requires_transaction,
        trade_value: portfolio_value.map(|v| delta * v),
      }
    })
    .collect();

  let turnover = trades.iter().map(|t| t.delta.abs()).sum::<f64>() / 2.0;
  let transactions_required = trades.iter().filter(|t| t.requires_transaction).count();

  Ok(RebalancePlan {
    threshold,
    trades,
    turnover,
    transactions_required,
    rebalanced: target.clone(),
  })
}

/// Weight-vector form of [`rebalance`].
pub fn rebalance_weights(
  current_weights: &[f64],
  target_weights: &[f64],
  asset_ids: Option<Vec<String>>,
  threshold: f64,
  portfolio_value: Option<f64>,
  tolerance: f64,
) -> Result<RebalancePlan> {
  if current_weights.len() != target_weights.len() {
    return Err(ComputeError::validation(format!(
      "current weights have {} entries, target weights {}",
      current_weights.len(),
      target_weights.len()
    )));
  }
  let ids = asset_ids.unwrap_or_else(|| default_asset_ids(current_weights.len()));
  let current = Portfolio::new(ids.clone(), current_weights.to_vec(), tolerance)?;
  let target = Portfolio::new(ids, target_weights.to_vec(), tolerance)?;
  rebalance(&current, &target, threshold, portfolio_value)
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::quant::returns::DEFAULT_WEIGHT_TOLERANCE;

  #[test]
  fn flags_only_deltas_above_threshold() {
    let plan = rebalance_weights(
      &[0.5, 0.3, 0.2],
      &[0.4, 0.33, 0.27],
      None,
      DEFAULT_REBALANCE_THRESHOLD,
      Some(100_000.0),
      DEFAULT_WEIGHT_TOLERANCE,
    )
    .unwrap();

    let actions: Vec<TradeAction> = plan.trades.iter().map(|t| t.action).collect();
    assert_eq!(actions, vec![TradeAction::Sell, TradeAction::Hold, TradeAction::Buy]);
    assert_eq!(plan.transactions_required, 2);
    assert_abs_diff_eq!(plan.turnover, 0.1, epsilon = 1e-12);
    assert_abs_diff_eq!(plan.trades[0].trade_value.unwrap(), -10_000.0, epsilon = 1e-6);
    assert_eq!(plan.transactions().count(), 2);
  }

  #[test]
  fn identical_portfolios_need_no_trades() {
    let plan = rebalance_weights(&[0.6, 0.4], &[0.6, 0.4], None, 0.0, None, DEFAULT_WEIGHT_TOLERANCE).unwrap();
    assert_eq!(plan.transactions_required, 0);
    assert_eq!(plan.turnover, 0.0);
    assert!(plan.trades.iter().all(|t| t.trade_value.is_none()));
  }

  #[test]
  fn invalid_inputs_are_rejected() {
    let tol = DEFAULT_WEIGHT_TOLERANCE;
    assert!(rebalance_weights(&[0.5, 0.5], &[1.0], None, 0.05, None, tol).is_err());
    assert!(rebalance_weights(&[0.5, 0.4], &[0.5, 0.5], None, 0.05, None, tol).is_err());
    assert!(rebalance_weights(&[0.5, 0.5], &[0.5, 0.5], None, -0.1, None, tol).is_err());
    assert!(rebalance_weights(&[0.5, 0.5], &[0.5, 0.5], None, 0.05, Some(0.0), tol).is_err());
  }
}
