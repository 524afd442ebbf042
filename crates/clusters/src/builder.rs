//! Batch cluster builder
//!
//! Seeds clusters from a bounded pool of records: DBSCAN within each source
//! partition, a quorum and size cap on the resulting groups, then the
//! semantic judge. Everything that does not end up in a cluster is orphaned.

use bentley::journal::Level;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::clustering::{candidate_groups, representative_sample, DbscanParams};
use crate::config::{BuilderConfig, ClustersConfig};
use crate::journal::RunJournal;
use crate::judge::{validate_group, JudgeRequest, SemanticJudge, Verdict};
use crate::metrics::compute_metrics;
use crate::models::{Cluster, ClusterSnapshot, Placement, ProblemRecord, SnapshotReason};
use crate::retry::RetryPolicy;
use crate::store::ClusterStore;
use crate::sync::IndexMirror;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
  pub clusters_created: Vec<String>,
  pub clustered_records: usize,
  pub orphaned_records: usize,
  /// Partitions with fewer records than the quorum
  pub skipped_partitions: Vec<String>,
  /// Records that were already active cluster members
  pub skipped_active: usize,
  pub rejected_groups: usize,
  /// Groups lost to judge failures or membership conflicts
  pub failed_groups: usize,
  pub index_queued: usize,
}

pub struct BatchBuilder {
  store: Arc<dyn ClusterStore>,
  judge: Arc<dyn SemanticJudge>,
  mirror: IndexMirror,
  quorum: usize,
  params: BuilderConfig,
  retry: RetryPolicy,
  journal: RunJournal,
}

impl BatchBuilder {
  pub fn new(
    config: &ClustersConfig,
    store: Arc<dyn ClusterStore>,
    judge: Arc<dyn SemanticJudge>,
    mirror: IndexMirror,
    journal: RunJournal,
  ) -> Self {
    Self {
      store,
      judge,
      mirror,
      quorum: config.quorum,
      params: config.builder.clone(),
      retry: config.retry.clone(),
      journal,
    }
  }

  pub async fn build(&self, records: &[ProblemRecord], now: DateTime<Utc>) -> Result<BatchReport> {
    let mut report = BatchReport::default();

    let mut partitions: BTreeMap<String, Vec<ProblemRecord>> = BTreeMap::new();
    for record in records {
      let stored = self.store.ingest_problem(record).await?;
      if stored.cluster_id().is_some() {
        report.skipped_active += 1;
        continue;
      }
      partitions.entry(stored.source_type.clone()).or_default().push(stored);
    }

    let mut clustered: BTreeSet<String> = BTreeSet::new();
    for (source_type, members) in &partitions {
      if members.len() < self.quorum {
        bentley::info!(
          "Skipping partition '{source_type}': {} records is below quorum {}",
          members.len(),
          self.quorum
        );
        report.skipped_partitions.push(source_type.clone());
        continue;
      }
      self.build_partition(source_type, members, now, &mut clustered, &mut report).await?;
    }

    for record in partitions.values().flatten() {
      if clustered.contains(&record.id) {
        continue;
      }
      report.orphaned_records += 1;
      if record.is_orphan() {
        continue;
      }
      let placement = Placement::orphan(now);
      self.store.set_placement(&record.id, Some(&placement)).await?;
      let orphan = ProblemRecord { placement: Some(placement), ..record.clone() };
      report.index_queued += self.mirror.mirror_all(std::slice::from_ref(&orphan)).await?;
    }

    bentley::info!(
      "Batch build: {} clusters created, {} records clustered, {} orphaned",
      report.clusters_created.len(),
      report.clustered_records,
      report.orphaned_records
    );
    Ok(report)
  }

  async fn build_partition(
    &self,
    source_type: &str,
    members: &[ProblemRecord],
    now: DateTime<Utc>,
    clustered: &mut BTreeSet<String>,
    report: &mut BatchReport,
  ) -> Result<()> {
    let refs: Vec<&ProblemRecord> = members.iter().collect();
    let params = DbscanParams { eps: self.params.eps, min_samples: self.params.min_samples };
    let groups = candidate_groups(&refs, params, self.quorum);
    bentley::verbose!("Partition '{source_type}': {} candidate groups", groups.len());

    for group in groups {
      let sample = representative_sample(&group, self.params.max_group_size);
      let request = JudgeRequest::from_records(sample.iter().copied(), Some(source_type));

      let verdict = validate_group(
        self.judge.as_ref(),
        &request,
        self.params.workflow_similarity_threshold,
        &self.retry,
      )
      .await;

      let proposal = match verdict {
        Ok(Verdict::Accepted(proposal)) => proposal,
        Ok(Verdict::Rejected { reason }) => {
          bentley::verbose!("Group of {} in '{source_type}' rejected: {reason}", group.len());
          report.rejected_groups += 1;
          continue;
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
          let message = format!("judge failed for a group of {} in '{source_type}': {e}", group.len());
          self.journal.warn("build", message, None).await;
          report.failed_groups += 1;
          continue;
        }
      };

      let sequence = self.store.next_cluster_sequence(source_type).await?;
      let cluster = Cluster {
        id: Cluster::format_id(source_type, sequence),
        name: proposal.name,
        description: proposal.description,
        source_type: source_type.to_string(),
        member_ids: group.iter().map(|r| r.id.clone()).collect(),
        similarity_confidence: proposal.similarity_score,
        created_at: now,
        last_activity_at: now,
        archived_at: None,
      };
      let owned: Vec<ProblemRecord> = group.iter().map(|r| (*r).clone()).collect();
      let snapshot =
        ClusterSnapshot::capture(&cluster.id, compute_metrics(&owned), SnapshotReason::Initial, now);

      match self.store.create_cluster(&cluster, Some(&snapshot)).await {
        Ok(()) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
          let message = format!("could not create cluster: {e}");
          self.journal.cluster(Level::Warn, "build", message, &cluster.id).await;
          report.failed_groups += 1;
          continue;
        }
      }

      let placed: Vec<ProblemRecord> = owned
        .into_iter()
        .map(|r| ProblemRecord { placement: Some(Placement::active(&cluster.id)), ..r })
        .collect();
      report.index_queued += self.mirror.mirror_all(&placed).await?;

      bentley::success!(
        "Created cluster {} '{}' with {} members",
        cluster.id,
        cluster.name,
        cluster.size()
      );
      clustered.extend(cluster.member_ids.iter().cloned());
      report.clustered_records += cluster.size();
      report.clusters_created.push(cluster.id);
    }
    Ok(())
  }
}
