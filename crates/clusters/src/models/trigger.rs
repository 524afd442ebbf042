//! Change triggers emitted by the change detector

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
  NewCluster,
  SignificantUpdate,
}

/// Re-scoring priority; ordered `Low < Medium < High`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  Medium,
  High,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Priority::Low => "low",
      Priority::Medium => "medium",
      Priority::High => "high",
    }
  }
}

/// A cluster whose metrics moved enough since its last snapshot to be re-scored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeTrigger {
  pub cluster_id: String,
  pub change_type: ChangeType,
  /// Human-readable deltas in the order they were evaluated
  pub reasons: Vec<String>,
  pub priority: Priority,
  /// Signed membership change since the previous snapshot
  pub size_delta: i64,
}

impl ChangeTrigger {
  /// Highest priority first, then the largest absolute size change
  pub fn review_order(a: &ChangeTrigger, b: &ChangeTrigger) -> Ordering {
    b.priority
      .cmp(&a.priority)
      .then_with(|| b.size_delta.abs().cmp(&a.size_delta.abs()))
      .then_with(|| a.cluster_id.cmp(&b.cluster_id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn trigger(id: &str, priority: Priority, size_delta: i64) -> ChangeTrigger {
    ChangeTrigger {
      cluster_id: id.to_string(),
      change_type: ChangeType::SignificantUpdate,
      reasons: vec![],
      priority,
      size_delta,
    }
  }

  #[test]
  fn test_review_order_priority_then_delta() {
    let mut triggers = vec![
      trigger("a", Priority::Medium, 6),
      trigger("b", Priority::High, 21),
      trigger("c", Priority::Medium, -9),
      trigger("d", Priority::Low, 40),
    ];
    triggers.sort_by(ChangeTrigger::review_order);
    let ids: Vec<_> = triggers.iter().map(|t| t.cluster_id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c", "a", "d"]);
  }
}
