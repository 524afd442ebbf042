use std::collections::HashSet;

use crate::frequency::average_signal;
use crate::models::{ClusterMetrics, ProblemRecord};

/// Derive the snapshot metrics for a cluster's current membership.
///
/// Blank authors and communities are not counted as distinct values.
pub fn compute_metrics(members: &[ProblemRecord]) -> ClusterMetrics {
  let authors: HashSet<&str> =
    members.iter().map(|m| m.author.trim()).filter(|a| !a.is_empty()).collect();
  let communities: HashSet<String> = members
    .iter()
    .map(|m| m.community.trim().to_lowercase())
    .filter(|c| !c.is_empty())
    .collect();

  ClusterMetrics {
    size: members.len(),
    unique_author_count: authors.len(),
    cross_community_count: communities.len(),
    avg_frequency_signal: average_signal(members.iter().map(|m| m.frequency.as_str())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  fn member(id: &str, author: &str, community: &str, frequency: &str) -> ProblemRecord {
    ProblemRecord::new(id, "reddit", "problem", vec![1.0], Utc::now())
      .with_author(author)
      .with_community(community)
      .with_frequency(frequency)
  }

  #[test]
  fn test_metrics_count_distinct_values() {
    let members = vec![
      member("1", "ana", "r/devops", "daily"),
      member("2", "ana", "r/DevOps", "weekly"),
      member("3", "bo", "r/sre", ""),
      member("4", "", "", "hourly"),
    ];
    let metrics = compute_metrics(&members);
    assert_eq!(metrics.size, 4);
    assert_eq!(metrics.unique_author_count, 2);
    assert_eq!(metrics.cross_community_count, 2);
    assert_eq!(metrics.avg_frequency_signal, (8.0 + 6.0 + 4.0 + 9.0) / 4.0);
  }

  #[test]
  fn test_empty_membership() {
    assert_eq!(compute_metrics(&[]), ClusterMetrics::default());
  }
}
