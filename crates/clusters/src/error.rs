//! Error types for the clusters engine
//!
//! Expected outcomes (a judge rejecting a group, a quorum not being met) are
//! plain values elsewhere in the crate. This enum is the fault channel only.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
  #[error("cluster store error: {0}")]
  Store(#[from] sqlx::Error),

  #[error("vector index error: {0}")]
  Index(String),

  #[error("judge transport error: {0}")]
  Transport(String),

  #[error("{operation} timed out after {elapsed_ms}ms")]
  Timeout { operation: String, elapsed_ms: u64 },

  #[error("malformed judge reply: {0}")]
  Malformed(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("membership claim conflict: {0}")]
  Conflict(String),

  #[error("consistency error: {0}")]
  Consistency(String),

  #[error("{0} not found")]
  NotFound(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl ClusterError {
  /// Network and timeout failures that are worth retrying
  pub fn is_transient(&self) -> bool {
    matches!(self, ClusterError::Index(_) | ClusterError::Transport(_) | ClusterError::Timeout { .. })
  }

  /// Failures that abort a whole run rather than a single record
  pub fn is_fatal(&self) -> bool {
    matches!(self, ClusterError::Store(_) | ClusterError::Config(_) | ClusterError::Io(_))
  }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_classification() {
    assert!(ClusterError::Transport("connection reset".into()).is_transient());
    assert!(ClusterError::Timeout { operation: "judge".into(), elapsed_ms: 10 }.is_transient());
    assert!(!ClusterError::Malformed("no json".into()).is_transient());
    assert!(!ClusterError::Conflict("p-1".into()).is_transient());
  }

  #[test]
  fn test_fatal_classification() {
    assert!(ClusterError::Config("quorum".into()).is_fatal());
    assert!(!ClusterError::Transport("reset".into()).is_fatal());
  }
}
