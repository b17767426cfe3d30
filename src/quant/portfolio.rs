//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Portfolio optimization, efficient frontier and rebalancing.

pub mod engine;
pub mod frontier;
pub mod optimizers;
mod qp;
pub mod rebalance;
pub mod types;

pub use engine::PortfolioEngine;
pub use engine::PortfolioEngineConfig;
pub use frontier::efficient_frontier;
pub use frontier::EfficientFrontier;
pub use frontier::FrontierPoint;
pub use optimizers::optimize_max_sharpe;
pub use optimizers::optimize_mean_variance;
pub use optimizers::optimize_risk_parity;
pub use optimizers::optimize_target_volatility;
pub use optimizers::optimize_with_mode;
pub use rebalance::rebalance;
pub use rebalance::rebalance_weights;
pub use rebalance::RebalancePlan;
pub use rebalance::RebalanceTrade;
pub use rebalance::TradeAction;
pub use types::AllocationProblem;
pub use types::OptimizationConstraints;
pub use types::OptimizationMode;
pub use types::OptimizationResult;
