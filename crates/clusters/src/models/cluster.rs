//! Clusters and their point-in-time snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A validated group of semantically equivalent problem records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
  pub id: String,
  pub name: String,
  pub description: String,
  /// Partition the cluster was built within
  pub source_type: String,
  pub member_ids: BTreeSet<String>,
  /// Judge similarity score for the group, in [0, 1]
  pub similarity_confidence: f32,
  pub created_at: DateTime<Utc>,
  pub last_activity_at: DateTime<Utc>,
  /// Set when the cluster is soft-deleted for inactivity
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archived_at: Option<DateTime<Utc>>,
}

impl Cluster {
  /// Cluster ids are `{source_type}_{sequence:02}`
  pub fn format_id(source_type: &str, sequence: u32) -> String {
    format!("{source_type}_{sequence:02}")
  }

  /// Sequence number encoded in a cluster id, if it follows the id format
  pub fn parse_sequence(id: &str) -> Option<u32> {
    id.rsplit_once('_').and_then(|(_, seq)| seq.parse().ok())
  }

  pub fn size(&self) -> usize {
    self.member_ids.len()
  }

  pub fn is_archived(&self) -> bool {
    self.archived_at.is_some()
  }
}

/// Why a snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
  Initial,
  BeforeRescoring,
  Periodic,
}

impl SnapshotReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      SnapshotReason::Initial => "initial",
      SnapshotReason::BeforeRescoring => "before_rescoring",
      SnapshotReason::Periodic => "periodic",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "initial" => Some(SnapshotReason::Initial),
      "before_rescoring" => Some(SnapshotReason::BeforeRescoring),
      "periodic" => Some(SnapshotReason::Periodic),
      _ => None,
    }
  }
}

/// Derived metrics for a cluster's current membership
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterMetrics {
  pub size: usize,
  pub unique_author_count: usize,
  pub cross_community_count: usize,
  pub avg_frequency_signal: f64,
}

/// Immutable point-in-time capture of a cluster's metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
  pub cluster_id: String,
  pub snapshot_time: DateTime<Utc>,
  #[serde(flatten)]
  pub metrics: ClusterMetrics,
  pub reason: SnapshotReason,
}

impl ClusterSnapshot {
  pub fn capture(
    cluster_id: &str,
    metrics: ClusterMetrics,
    reason: SnapshotReason,
    at: DateTime<Utc>,
  ) -> Self {
    Self { cluster_id: cluster_id.to_string(), snapshot_time: at, metrics, reason }
  }
}
