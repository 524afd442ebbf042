//! Lifecycle manager
//!
//! Housekeeping that runs after assignment: orphan marking, consistency
//! repair, orphan expiry and cluster archival. Repairs are logged as warnings
//! and journaled; deletion failures are journaled with the record ids and
//! never abort the pass.

use bentley::journal::Level;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{ClustersConfig, LifecycleConfig};
use crate::journal::RunJournal;
use crate::store::ClusterStore;
use crate::sync::IndexMirror;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifecycleReport {
  pub marked_orphans: usize,
  /// Records that pointed at a cluster that no longer exists
  pub repaired_dangling: usize,
  pub dissolved_clusters: Vec<String>,
  pub expired_orphans: usize,
  /// Ids whose deletion failed on either side
  pub deletion_failures: Vec<String>,
  pub archived_clusters: Vec<String>,
  pub index_queued: usize,
}

pub struct LifecycleManager {
  store: Arc<dyn ClusterStore>,
  mirror: IndexMirror,
  quorum: usize,
  retention: LifecycleConfig,
  journal: RunJournal,
}

impl LifecycleManager {
  pub fn new(
    config: &ClustersConfig,
    store: Arc<dyn ClusterStore>,
    mirror: IndexMirror,
    journal: RunJournal,
  ) -> Self {
    Self { store, mirror, quorum: config.quorum, retention: config.lifecycle.clone(), journal }
  }

  /// Run every housekeeping step in order
  pub async fn run(&self, now: DateTime<Utc>) -> Result<LifecycleReport> {
    let mut report = LifecycleReport::default();

    let (marked, queued) = self.mark_orphans(now).await?;
    report.marked_orphans = marked;
    report.index_queued += queued;

    let (dangling, dissolved, queued) = self.repair_consistency(now).await?;
    report.repaired_dangling = dangling;
    report.dissolved_clusters = dissolved;
    report.index_queued += queued;

    let (expired, failures) = self.expire_orphans(now).await?;
    report.expired_orphans = expired;
    report.deletion_failures = failures;

    report.archived_clusters = self.archive_inactive(now).await?;

    bentley::info!(
      "Lifecycle: {} marked orphan, {} repaired, {} dissolved, {} expired, {} archived",
      report.marked_orphans,
      report.repaired_dangling,
      report.dissolved_clusters.len(),
      report.expired_orphans,
      report.archived_clusters.len()
    );
    Ok(report)
  }

  /// Orphan every record without a cluster that is not already a well-formed orphan.
  /// Returns (changed, index writes queued).
  pub async fn mark_orphans(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
    let changed = self.store.mark_orphans(now).await?;
    if changed.is_empty() {
      return Ok((0, 0));
    }
    bentley::verbose!("Marked {} records as orphans", changed.len());
    let queued = self.mirror_ids(&changed).await?;
    Ok((changed.len(), queued))
  }

  /// Orphan dangling members and dissolve clusters that fell below quorum.
  /// Returns (dangling repaired, dissolved cluster ids, index writes queued).
  pub async fn repair_consistency(
    &self,
    now: DateTime<Utc>,
  ) -> Result<(usize, Vec<String>, usize)> {
    let mut touched = Vec::new();

    let dangling = self.store.orphan_dangling_members(now).await?;
    for id in &dangling {
      self.journal.warn("repair", "referenced a missing cluster, orphaned", Some(id.as_str())).await;
    }
    touched.extend(dangling.iter().cloned());

    let mut dissolved = Vec::new();
    for cluster_id in self.store.undersized_clusters(self.quorum).await? {
      let members = self.store.dissolve_cluster(&cluster_id, now).await?;
      let message = format!(
        "cluster {cluster_id} below quorum {}, dissolved ({} members orphaned)",
        self.quorum,
        members.len()
      );
      self.journal.cluster(Level::Warn, "repair", message, &cluster_id).await;
      touched.extend(members);
      dissolved.push(cluster_id);
    }

    let queued = self.mirror_ids(&touched).await?;
    Ok((dangling.len(), dissolved, queued))
  }

  /// Delete orphans older than the retention window from index and store.
  /// Returns (deleted from store, ids with a failed deletion).
  pub async fn expire_orphans(&self, now: DateTime<Utc>) -> Result<(usize, Vec<String>)> {
    let cutoff = now - Duration::days(self.retention.orphan_ttl_days);
    let ids: Vec<String> =
      self.store.orphans_before(cutoff).await?.into_iter().map(|r| r.id).collect();
    if ids.is_empty() {
      return Ok((0, Vec::new()));
    }

    // Failed index deletes are already in the backlog; the store row still goes
    let mut failures = self.mirror.remove(&ids).await?;
    if !failures.is_empty() {
      let message = format!("index delete failed for {}, queued for replay", failures.join(", "));
      self.journal.error("expire", message, None).await;
    }

    let deleted = match self.store.delete_problems(&ids).await {
      Ok(deleted) => deleted as usize,
      Err(e) => {
        self
          .journal
          .error("expire", format!("store delete failed for {}: {e}", ids.join(", ")), None)
          .await;
        failures.extend(ids.iter().cloned());
        0
      }
    };
    failures.sort();
    failures.dedup();

    bentley::verbose!("Expired {deleted} orphans older than {cutoff}");
    Ok((deleted, failures))
  }

  /// Archive clusters with no activity inside the archival window
  pub async fn archive_inactive(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
    let cutoff = now - Duration::days(self.retention.archive_after_days);
    let mut archived = Vec::new();
    for cluster in self.store.inactive_clusters(cutoff).await? {
      self.store.archive_cluster(&cluster.id, now).await?;
      let message =
        format!("archived '{}' (last activity {})", cluster.name, cluster.last_activity_at);
      self.journal.cluster(Level::Info, "archive", message, &cluster.id).await;
      archived.push(cluster.id);
    }
    Ok(archived)
  }

  async fn mirror_ids(&self, ids: &[String]) -> Result<usize> {
    if ids.is_empty() {
      return Ok(0);
    }
    let records = self.store.get_problems(ids).await?;
    self.mirror.mirror_all(&records).await
  }
}
