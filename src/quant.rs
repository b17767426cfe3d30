//! # Quantitative Calculators
//!
//! $$
//! r_{p,t} = \mathbf{w}^\top \mathbf{r}_t
//! $$
//!
//! Pure, synchronous calculators. Every entry point returns `Result<_, ComputeError>`
//! and never touches the task orchestrator.
//!
//! ## Modules
//!
//! | Module            | Description                                                              |
//! |-------------------|--------------------------------------------------------------------------|
//! | [`returns`]       | Return matrices (`periods × assets`) and validated portfolios.          |
//! | [`linalg`]        | Covariance validation, Cholesky with PSD fallback, risk contributions.  |
//! | [`risk`]          | Historical, parametric and Monte Carlo VaR/CVaR plus return metrics.    |
//! | [`monte_carlo`]   | Seeded correlated path simulation and deterministic stress scenarios.   |
//! | [`portfolio`]     | Mean-variance, risk parity, max Sharpe, efficient frontier, rebalancing.|

pub mod linalg;
pub mod monte_carlo;
pub mod portfolio;
pub mod returns;
pub mod risk;

/// Trading periods per year used for annualization.
pub const PERIODS_PER_YEAR: f64 = 252.0;
