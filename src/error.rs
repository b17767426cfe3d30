//! # Errors
//!
//! Typed failures raised by the calculators and the orchestrator.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Errors produced while validating, computing or dispatching a computation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputeError {
  /// Malformed or out-of-range input.
  #[error("validation error: {0}")]
  Validation(String),

  /// Ill-conditioned matrix, non-convergence or a zero denominator.
  #[error("numerical error: {0}")]
  Numerical(String),

  /// Infeasible constraint set.
  #[error("optimization error: {0}")]
  Optimization(String),

  /// Computation exceeded the lane time budget.
  #[error("computation timed out after {0:?}")]
  Timeout(Duration),

  /// Queue or cache unavailable.
  #[error("transient infrastructure error: {0}")]
  TransientInfrastructure(String),

  /// Worker panicked or the executor broke an invariant.
  #[error("internal error: {0}")]
  Internal(String),
}

impl ComputeError {
  /// Kind used in task failure records.
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation(_) => ErrorKind::ValidationError,
      Self::Numerical(_) => ErrorKind::NumericalError,
      Self::Optimization(_) => ErrorKind::OptimizationError,
      Self::Timeout(_) => ErrorKind::TimeoutError,
      Self::TransientInfrastructure(_) => ErrorKind::TransientInfrastructureError,
      Self::Internal(_) => ErrorKind::InternalError,
    }
  }

  /// Whether the retry policy applies.
  pub fn is_transient(&self) -> bool {
    self.kind().is_transient()
  }

  pub(crate) fn validation(msg: impl Into<String>) -> Self {
    Self::Validation(msg.into())
  }

  pub(crate) fn numerical(msg: impl Into<String>) -> Self {
    Self::Numerical(msg.into())
  }

  pub(crate) fn optimization(msg: impl Into<String>) -> Self {
    Self::Optimization(msg.into())
  }
}

impl From<serde_json::Error> for ComputeError {
  fn from(err: serde_json::Error) -> Self {
    Self::Validation(format!("malformed parameters: {err}"))
  }
}

/// Error taxonomy entry recorded on failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  ValidationError,
  NumericalError,
  OptimizationError,
  TimeoutError,
  TransientInfrastructureError,
  InternalError,
}

impl ErrorKind {
  /// Timeouts and infrastructure hiccups are retried, everything else is permanent.
  pub fn is_transient(self) -> bool {
    matches!(self, Self::TimeoutError | Self::TransientInfrastructureError)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::ValidationError => "validation_error",
      Self::NumericalError => "numerical_error",
      Self::OptimizationError => "optimization_error",
      Self::TimeoutError => "timeout_error",
      Self::TransientInfrastructureError => "transient_infrastructure_error",
      Self::InternalError => "internal_error",
    }
  }
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}
