//! Candidate group discovery for the batch builder

pub mod dbscan;

pub use dbscan::{dbscan, DbscanParams};

use crate::models::ProblemRecord;
use crate::similarity::{centroid, cosine_similarity};

/// DBSCAN groups of at least `quorum` records; smaller groups are treated as noise
pub fn candidate_groups<'a>(
  records: &[&'a ProblemRecord],
  params: DbscanParams,
  quorum: usize,
) -> Vec<Vec<&'a ProblemRecord>> {
  let points: Vec<&[f32]> = records.iter().map(|r| r.embedding.as_slice()).collect();
  dbscan(&points, params)
    .into_iter()
    .filter(|group| group.len() >= quorum)
    .map(|group| group.into_iter().map(|i| records[i]).collect())
    .collect()
}

/// The `max` members closest to the group centroid, most central first.
///
/// Groups at or under `max` are returned unchanged.
pub fn representative_sample<'a>(
  group: &[&'a ProblemRecord],
  max: usize,
) -> Vec<&'a ProblemRecord> {
  if group.len() <= max {
    return group.to_vec();
  }
  let Some(center) = centroid(group.iter().map(|r| r.embedding.as_slice())) else {
    return group.iter().take(max).copied().collect();
  };

  let mut ranked: Vec<(f32, &'a ProblemRecord)> =
    group.iter().map(|r| (cosine_similarity(&center, &r.embedding), *r)).collect();
  ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
  ranked.into_iter().take(max).map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  fn record(id: &str, embedding: Vec<f32>) -> ProblemRecord {
    ProblemRecord::new(id, "reddit", "problem", embedding, Utc::now())
  }

  #[test]
  fn test_sub_quorum_groups_dropped() {
    let records = vec![
      record("a1", vec![1.0, 0.0]),
      record("a2", vec![0.99, 0.01]),
      record("a3", vec![0.98, 0.02]),
      record("b1", vec![0.0, 1.0]),
      record("b2", vec![0.01, 0.99]),
      record("b3", vec![0.02, 0.98]),
      record("b4", vec![0.0, 0.97]),
    ];
    let refs: Vec<&ProblemRecord> = records.iter().collect();
    let groups = candidate_groups(&refs, DbscanParams { eps: 0.05, min_samples: 3 }, 4);
    assert_eq!(groups.len(), 1);
    let ids: Vec<_> = groups[0].iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["b1", "b2", "b3", "b4"]);
  }

  #[test]
  fn test_sample_keeps_most_central() {
    let records = vec![
      record("edge", vec![1.0, 0.6]),
      record("core1", vec![1.0, 0.1]),
      record("core2", vec![1.0, 0.12]),
      record("core3", vec![1.0, 0.08]),
    ];
    let refs: Vec<&ProblemRecord> = records.iter().collect();
    let sample = representative_sample(&refs, 3);
    assert_eq!(sample.len(), 3);
    assert!(sample.iter().all(|r| r.id != "edge"));
    assert_eq!(representative_sample(&refs, 10).len(), 4);
  }
}
