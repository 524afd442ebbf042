//! Bounded retry with exponential backoff for judge and index calls

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::{ClusterError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_initial_backoff_ms")]
  pub initial_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
  /// Per-attempt budget for a judge call
  #[serde(default = "default_judge_timeout_secs")]
  pub judge_timeout_secs: u64,
  /// Per-attempt budget for a vector index call
  #[serde(default = "default_index_timeout_ms")]
  pub index_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
  3
}
fn default_initial_backoff_ms() -> u64 {
  200
}
fn default_max_backoff_ms() -> u64 {
  5_000
}
fn default_judge_timeout_secs() -> u64 {
  180
}
fn default_index_timeout_ms() -> u64 {
  800
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      initial_backoff_ms: default_initial_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
      judge_timeout_secs: default_judge_timeout_secs(),
      index_timeout_ms: default_index_timeout_ms(),
    }
  }
}

impl RetryPolicy {
  /// A single attempt with no waiting; used by tests and dry runs
  pub fn immediate() -> Self {
    Self { max_attempts: 1, initial_backoff_ms: 0, max_backoff_ms: 0, ..Self::default() }
  }

  pub fn judge_timeout(&self) -> Duration {
    Duration::from_secs(self.judge_timeout_secs)
  }

  pub fn index_timeout(&self) -> Duration {
    Duration::from_millis(self.index_timeout_ms)
  }

  /// Delay before retry number `attempt` (1-based), doubling up to the cap
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
  }
}

/// Run `operation` under a per-attempt timeout, retrying transient failures.
///
/// Non-transient errors are returned immediately. After the last attempt the
/// final error is returned so the caller can defer the work.
pub async fn with_retry<T, F, Fut>(
  policy: &RetryPolicy,
  budget: Duration,
  label: &str,
  mut operation: F,
) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let attempts = policy.max_attempts.max(1);
  let mut attempt = 1;
  loop {
    let outcome = match timeout(budget, operation()).await {
      Ok(result) => result,
      Err(_) => Err(ClusterError::Timeout {
        operation: label.to_string(),
        elapsed_ms: budget.as_millis() as u64,
      }),
    };

    match outcome {
      Ok(value) => return Ok(value),
      Err(e) if e.is_transient() && attempt < attempts => {
        let delay = policy.backoff(attempt);
        bentley::verbose!("{label}: attempt {attempt}/{attempts} failed ({e}), retrying in {delay:?}");
        sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}
