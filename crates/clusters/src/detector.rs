//! Change detector
//!
//! Compares each live cluster's current metrics with its latest snapshot and
//! flags the ones that drifted enough to need re-scoring. Detection reads only;
//! snapshots are written when the caller asks for them.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{ClustersConfig, DetectorConfig};
use crate::metrics::compute_metrics;
use crate::models::{
  ChangeTrigger, ChangeType, ClusterMetrics, ClusterSnapshot, Priority, SnapshotReason,
};
use crate::store::ClusterStore;
use crate::{ClusterError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectOptions {
  /// Record a `periodic` snapshot for every inspected cluster after evaluation
  pub write_periodic_snapshots: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionReport {
  /// Flagged clusters, highest priority first
  pub triggers: Vec<ChangeTrigger>,
  pub inspected: usize,
  pub snapshots_written: usize,
}

pub struct ChangeDetector {
  store: Arc<dyn ClusterStore>,
  thresholds: DetectorConfig,
}

impl ChangeDetector {
  pub fn new(config: &ClustersConfig, store: Arc<dyn ClusterStore>) -> Self {
    Self { store, thresholds: config.detector.clone() }
  }

  /// Evaluate every non-archived cluster against its latest snapshot
  pub async fn detect(
    &self,
    now: DateTime<Utc>,
    options: DetectOptions,
  ) -> Result<DetectionReport> {
    let mut report = DetectionReport::default();

    for cluster in self.store.list_clusters(false).await? {
      let members = self.store.cluster_members(&cluster.id).await?;
      let current = compute_metrics(&members);
      let previous = self.store.latest_snapshot(&cluster.id).await?;
      report.inspected += 1;

      if let Some(trigger) = evaluate(&self.thresholds, &cluster.id, &current, previous.as_ref(), now) {
        bentley::verbose!(
          "{} flagged ({}): {}",
          trigger.cluster_id,
          trigger.priority.as_str(),
          trigger.reasons.join(", ")
        );
        report.triggers.push(trigger);
      }

      if options.write_periodic_snapshots {
        let snapshot = ClusterSnapshot::capture(&cluster.id, current, SnapshotReason::Periodic, now);
        self.store.insert_snapshot(&snapshot).await?;
        report.snapshots_written += 1;
      }
    }

    report.triggers.sort_by(ChangeTrigger::review_order);
    bentley::info!(
      "Change detection: {} of {} clusters flagged",
      report.triggers.len(),
      report.inspected
    );
    Ok(report)
  }

  /// Record the cluster's current metrics, e.g. `before_rescoring` from a scoring stage
  pub async fn capture_snapshot(
    &self,
    cluster_id: &str,
    reason: SnapshotReason,
    now: DateTime<Utc>,
  ) -> Result<ClusterSnapshot> {
    if self.store.get_cluster(cluster_id).await?.is_none() {
      return Err(ClusterError::NotFound(format!("cluster {cluster_id}")));
    }
    let members = self.store.cluster_members(cluster_id).await?;
    let snapshot = ClusterSnapshot::capture(cluster_id, compute_metrics(&members), reason, now);
    self.store.insert_snapshot(&snapshot).await?;
    Ok(snapshot)
  }

  /// Live clusters with no snapshot inside the refresh window
  pub async fn refresh_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
    let since = now - Duration::days(self.thresholds.refresh_after_days);
    self.store.clusters_without_snapshot_since(since).await
  }
}

/// Decide whether a cluster's metrics moved enough since `previous`
pub fn evaluate(
  thresholds: &DetectorConfig,
  cluster_id: &str,
  current: &ClusterMetrics,
  previous: Option<&ClusterSnapshot>,
  now: DateTime<Utc>,
) -> Option<ChangeTrigger> {
  let Some(previous) = previous else {
    return Some(ChangeTrigger {
      cluster_id: cluster_id.to_string(),
      change_type: ChangeType::NewCluster,
      reasons: vec!["new cluster".to_string()],
      priority: Priority::High,
      size_delta: current.size as i64,
    });
  };

  let before = &previous.metrics;
  let size_delta = current.size as i64 - before.size as i64;
  let author_delta = current.unique_author_count as i64 - before.unique_author_count as i64;
  let community_delta = current.cross_community_count as i64 - before.cross_community_count as i64;

  let mut reasons = Vec::new();

  let ratio_fired =
    before.size > 0 && size_delta as f64 / before.size as f64 >= thresholds.min_size_ratio;
  if size_delta >= thresholds.min_size_delta || ratio_fired {
    reasons.push(format!("added {size_delta} new events"));
  }
  if author_delta >= thresholds.min_author_delta {
    reasons.push(format!("added {author_delta} new authors"));
  }
  if community_delta >= thresholds.min_community_delta {
    reasons.push("cross-community count increased".to_string());
  }
  if (now - previous.snapshot_time).num_days() >= thresholds.refresh_after_days {
    reasons.push("time-based refresh".to_string());
  }

  if reasons.is_empty() {
    return None;
  }

  let priority =
    if size_delta >= thresholds.high_priority_size_delta { Priority::High } else { Priority::Medium };

  Some(ChangeTrigger {
    cluster_id: cluster_id.to_string(),
    change_type: ChangeType::SignificantUpdate,
    reasons,
    priority,
    size_delta,
  })
}
