//! # portfolio-risk
//!
//! Portfolio risk metrics, Monte Carlo simulation and allocation optimizers,
//! plus an asynchronous orchestrator that deduplicates, caches and retries
//! long-running computations.
//!
//! | Module           | Contents                                                    |
//! |------------------|-------------------------------------------------------------|
//! | [`quant`]        | return series, VaR/CVaR, performance metrics, Monte Carlo, optimizers |
//! | [`orchestrator`] | submission, lanes, workers, broker and result cache         |
//! | [`error`]        | the shared error taxonomy                                   |
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod error;
pub mod orchestrator;
pub mod quant;

pub use error::ComputeError;
pub use error::ErrorKind;
pub use orchestrator::Orchestrator;
pub use orchestrator::OrchestratorConfig;
