//! Merge scoring for candidate clusters

use std::collections::BTreeMap;

use crate::index::Neighbor;

/// Logarithmic preference for established clusters
pub fn size_boost(size: usize, divisor: f32) -> f32 {
  ((size + 1) as f32).ln() / divisor
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
  pub cluster_id: String,
  /// Mean similarity of the cluster's members within the neighbor set
  pub mean_similarity: f32,
  /// Full membership of the cluster, not just the members that were hit
  pub size: usize,
  pub score: f32,
}

impl CandidateScore {
  pub fn new(cluster_id: &str, similarities: &[f32], size: usize, divisor: f32) -> Self {
    let mean_similarity = if similarities.is_empty() {
      0.0
    } else {
      similarities.iter().sum::<f32>() / similarities.len() as f32
    };
    Self {
      cluster_id: cluster_id.to_string(),
      mean_similarity,
      size,
      score: mean_similarity + size_boost(size, divisor),
    }
  }
}

/// Similarities per cluster id among active neighbors
pub fn group_by_cluster(neighbors: &[Neighbor]) -> BTreeMap<String, Vec<f32>> {
  let mut groups: BTreeMap<String, Vec<f32>> = BTreeMap::new();
  for neighbor in neighbors {
    if let Some(cluster_id) = &neighbor.metadata.cluster_id {
      groups.entry(cluster_id.clone()).or_default().push(neighbor.similarity);
    }
  }
  groups
}

/// Highest score wins; ties go to the larger cluster, then the lower id
pub fn best_candidate(candidates: Vec<CandidateScore>) -> Option<CandidateScore> {
  candidates.into_iter().max_by(|a, b| {
    a.score
      .total_cmp(&b.score)
      .then_with(|| a.size.cmp(&b.size))
      .then_with(|| b.cluster_id.cmp(&a.cluster_id))
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::index::IndexMetadata;
  use crate::models::LifecycleStage;
  use chrono::Utc;

  #[test]
  fn test_larger_cluster_wins_at_equal_similarity() {
    let small = CandidateScore::new("reddit_01", &[0.78, 0.78], 5, 10.0);
    let large = CandidateScore::new("reddit_02", &[0.78], 50, 10.0);
    assert!((small.score - (0.78 + 6f32.ln() / 10.0)).abs() < 1e-6);
    assert!((large.score - (0.78 + 51f32.ln() / 10.0)).abs() < 1e-6);

    let best = best_candidate(vec![small, large]).unwrap();
    assert_eq!(best.cluster_id, "reddit_02");
  }

  #[test]
  fn test_group_by_cluster_ignores_unclustered() {
    let neighbor = |id: &str, cluster: Option<&str>, similarity: f32| Neighbor {
      id: id.to_string(),
      similarity,
      metadata: IndexMetadata {
        cluster_id: cluster.map(str::to_string),
        lifecycle_stage: Some(LifecycleStage::Active),
        source_type: "reddit".to_string(),
        extracted_at: Utc::now(),
      },
    };
    let groups = group_by_cluster(&[
      neighbor("a", Some("c1"), 0.9),
      neighbor("b", Some("c1"), 0.7),
      neighbor("c", None, 0.99),
      neighbor("d", Some("c2"), 0.5),
    ]);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups["c1"], vec![0.9, 0.7]);
  }

  #[test]
  fn test_no_candidates() {
    assert!(best_candidate(Vec::new()).is_none());
  }
}
