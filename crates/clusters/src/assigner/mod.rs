//! Streaming cluster assigner
//!
//! Routes each incoming record in three steps: merge into the best-scoring
//! active cluster, else try to found a new cluster with recent similar
//! orphans, else orphan the record. The store is written first, then the
//! index is mirrored. A record that cannot be routed this pass (judge or
//! index unavailable, membership conflict) is deferred and retried next pass.

pub mod scoring;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::clustering::representative_sample;
use crate::config::{AssignerConfig, ClustersConfig};
use crate::index::MetadataFilter;
use crate::journal::RunJournal;
use crate::judge::{self, ClusterSummary, JudgeRequest, SemanticJudge, Verdict};
use crate::models::{Cluster, Placement, ProblemRecord};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::ClusterStore;
use crate::sync::{IndexMirror, MirrorOutcome};
use crate::Result;

use scoring::{best_candidate, group_by_cluster, CandidateScore};

/// What happened to one incoming record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Assignment {
  Merged { cluster_id: String, score: f32 },
  Founded { cluster_id: String, members: usize },
  Orphaned { since: DateTime<Utc> },
  /// Already an active member; nothing was written
  Unchanged { cluster_id: String },
  Deferred { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignmentReport {
  pub merged: usize,
  pub founded: Vec<String>,
  pub newly_clustered: usize,
  pub orphaned: usize,
  pub unchanged: usize,
  pub deferred: usize,
  pub index_queued: usize,
  /// Clusters whose membership changed in this batch
  pub touched_clusters: BTreeSet<String>,
  pub summaries_refreshed: usize,
  pub summaries_fallback: usize,
}

pub struct StreamingAssigner {
  store: Arc<dyn ClusterStore>,
  judge: Arc<dyn SemanticJudge>,
  mirror: IndexMirror,
  quorum: usize,
  max_group_size: usize,
  workflow_similarity_threshold: f32,
  params: AssignerConfig,
  retry: RetryPolicy,
  journal: RunJournal,
}

impl StreamingAssigner {
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
      max_group_size: config.builder.max_group_size,
      workflow_similarity_threshold: config.builder.workflow_similarity_threshold,
      params: config.assigner.clone(),
      retry: config.retry.clone(),
      journal,
    }
  }

  /// Route every record, then refresh the summaries of touched clusters
  pub async fn assign_batch(
    &self,
    records: &[ProblemRecord],
    now: DateTime<Utc>,
  ) -> Result<AssignmentReport> {
    let mut report = AssignmentReport::default();

    for record in records {
      let (assignment, queued) = match self.assign(record, now).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
          let reason = e.to_string();
          self.store.defer_assignment(&record.id, &reason, now).await?;
          let message = format!("deferred to next pass: {reason}");
          self.journal.warn("assign", message, Some(record.id.as_str())).await;
          (Assignment::Deferred { reason }, 0)
        }
      };
      report.index_queued += queued;

      match &assignment {
        Assignment::Merged { cluster_id, .. } => {
          report.merged += 1;
          report.touched_clusters.insert(cluster_id.clone());
        }
        Assignment::Founded { cluster_id, members } => {
          report.newly_clustered += members;
          report.founded.push(cluster_id.clone());
          report.touched_clusters.insert(cluster_id.clone());
        }
        Assignment::Orphaned { .. } => report.orphaned += 1,
        Assignment::Unchanged { .. } => report.unchanged += 1,
        Assignment::Deferred { .. } => report.deferred += 1,
      }
    }

    let (refreshed, fallback) = self.refresh_summaries(&report.touched_clusters).await?;
    report.summaries_refreshed = refreshed;
    report.summaries_fallback = fallback;

    bentley::info!(
      "Assigned {} records: {} merged, {} founded clusters, {} orphaned, {} unchanged, {} deferred",
      records.len(),
      report.merged,
      report.founded.len(),
      report.orphaned,
      report.unchanged,
      report.deferred
    );
    Ok(report)
  }

  /// Route one record. Returns the outcome and how many index writes were queued.
  ///
  /// Errors mean the record was not routed and nothing was half-written.
  pub async fn assign(
    &self,
    record: &ProblemRecord,
    now: DateTime<Utc>,
  ) -> Result<(Assignment, usize)> {
    let stored = self.store.ingest_problem(record).await?;

    if let Some(cluster_id) = stored.cluster_id() {
      self.store.clear_deferred(&stored.id).await?;
      return Ok((Assignment::Unchanged { cluster_id: cluster_id.to_string() }, 0));
    }

    let outcome = if let Some(candidate) = self.find_similar_cluster(&stored).await? {
      self.merge(&stored, candidate, now).await?
    } else if let Some(founded) = self.try_found_cluster(&stored, now).await? {
      founded
    } else {
      self.orphan(&stored, now).await?
    };

    self.store.clear_deferred(&stored.id).await?;
    Ok(outcome)
  }

  /// Best-scoring live cluster among the record's active neighbors, if it
  /// clears the merge threshold
  pub async fn find_similar_cluster(
    &self,
    record: &ProblemRecord,
  ) -> Result<Option<CandidateScore>> {
    let filter = MetadataFilter::active().excluding(&record.id);
    let index = self.mirror.index();
    let neighbors = with_retry(&self.retry, self.retry.index_timeout(), "index query", || {
      index.query_nearest(&record.embedding, self.params.neighbor_k, &filter)
    })
    .await?;

    let mut candidates = Vec::new();
    for (cluster_id, similarities) in group_by_cluster(&neighbors) {
      let Some(cluster) = self.store.get_cluster(&cluster_id).await? else {
        bentley::verbose!("Neighbor cluster {cluster_id} no longer exists, skipping");
        continue;
      };
      if cluster.is_archived() {
        continue;
      }
      candidates.push(CandidateScore::new(
        &cluster_id,
        &similarities,
        cluster.size(),
        self.params.size_boost_divisor,
      ));
    }

    Ok(best_candidate(candidates).filter(|best| best.score >= self.params.merge_threshold))
  }

  async fn merge(
    &self,
    record: &ProblemRecord,
    candidate: CandidateScore,
    now: DateTime<Utc>,
  ) -> Result<(Assignment, usize)> {
    self.store.add_members(&candidate.cluster_id, std::slice::from_ref(&record.id), now).await?;

    let placed =
      ProblemRecord { placement: Some(Placement::active(&candidate.cluster_id)), ..record.clone() };
    let queued = queued_count(self.mirror.mirror(&placed).await?);

    bentley::verbose!(
      "Merged {} into {} (score {:.3}, mean {:.3}, size {})",
      record.id,
      candidate.cluster_id,
      candidate.score,
      candidate.mean_similarity,
      candidate.size
    );
    Ok((Assignment::Merged { cluster_id: candidate.cluster_id, score: candidate.score }, queued))
  }

  /// Found a cluster from the record plus recent similar orphans, if the judge accepts them
  pub async fn try_found_cluster(
    &self,
    record: &ProblemRecord,
    now: DateTime<Utc>,
  ) -> Result<Option<(Assignment, usize)>> {
    let window_end = record.extracted_at;
    let window_start = window_end - Duration::hours(self.params.orphan_window_hours);
    let filter = MetadataFilter::orphans()
      .excluding(&record.id)
      .extracted_between(window_start, window_end)
      .min_similarity(self.params.orphan_similarity_threshold);

    let index = self.mirror.index();
    let neighbors = with_retry(&self.retry, self.retry.index_timeout(), "index query", || {
      index.query_nearest(&record.embedding, self.params.orphan_query_limit, &filter)
    })
    .await?;

    // The index is a replica; confirm each candidate is still an in-window orphan
    let ids: Vec<String> = neighbors.into_iter().map(|n| n.id).collect();
    let orphans: Vec<ProblemRecord> = self
      .store
      .get_problems(&ids)
      .await?
      .into_iter()
      .filter(|o| o.is_orphan() && o.extracted_at >= window_start && o.extracted_at <= window_end)
      .collect();

    let needed = self.quorum.saturating_sub(1);
    if orphans.len() < needed {
      bentley::verbose!(
        "{}: {} qualifying orphans, {} needed to found a cluster",
        record.id,
        orphans.len(),
        needed
      );
      return Ok(None);
    }

    let mut group: Vec<&ProblemRecord> = orphans.iter().collect();
    group.push(record);
    let sample = representative_sample(&group, self.max_group_size);
    let request = JudgeRequest::from_records(sample.iter().copied(), Some(record.source_type.as_str()));

    let proposal = match judge::validate_group(
      self.judge.as_ref(),
      &request,
      self.workflow_similarity_threshold,
      &self.retry,
    )
    .await?
    {
      Verdict::Accepted(proposal) => proposal,
      Verdict::Rejected { reason } => {
        bentley::verbose!("{}: founding group rejected: {reason}", record.id);
        return Ok(None);
      }
    };

    let sequence = self.store.next_cluster_sequence(&record.source_type).await?;
    let cluster = Cluster {
      id: Cluster::format_id(&record.source_type, sequence),
      name: proposal.name,
      description: proposal.description,
      source_type: record.source_type.clone(),
      member_ids: group.iter().map(|r| r.id.clone()).collect(),
      similarity_confidence: proposal.similarity_score,
      created_at: now,
      last_activity_at: now,
      archived_at: None,
    };
    self.store.create_cluster(&cluster, None).await?;

    let placed: Vec<ProblemRecord> = group
      .iter()
      .map(|r| ProblemRecord { placement: Some(Placement::active(&cluster.id)), ..(*r).clone() })
      .collect();
    let queued = self.mirror.mirror_all(&placed).await?;

    bentley::success!(
      "Founded cluster {} '{}' with {} members",
      cluster.id,
      cluster.name,
      cluster.size()
    );
    Ok(Some((Assignment::Founded { cluster_id: cluster.id.clone(), members: cluster.size() }, queued)))
  }

  /// Orphan the record; an existing orphan keeps its original timestamp
  async fn orphan(&self, record: &ProblemRecord, now: DateTime<Utc>) -> Result<(Assignment, usize)> {
    if let Some(since) = record.orphan_since() {
      return Ok((Assignment::Orphaned { since }, 0));
    }

    let placement = Placement::orphan(now);
    self.store.set_placement(&record.id, Some(&placement)).await?;
    let orphaned = ProblemRecord { placement: Some(placement), ..record.clone() };
    let queued = queued_count(self.mirror.mirror(&orphaned).await?);
    Ok((Assignment::Orphaned { since: now }, queued))
  }

  /// Regenerate name and description for each cluster. Returns (judge, fallback) counts.
  pub async fn refresh_summaries(&self, cluster_ids: &BTreeSet<String>) -> Result<(usize, usize)> {
    let (mut refreshed, mut fallback) = (0, 0);

    for cluster_id in cluster_ids {
      let members = self.store.cluster_members(cluster_id).await?;
      if members.is_empty() {
        continue;
      }
      let refs: Vec<&ProblemRecord> = members.iter().collect();
      let sample = representative_sample(&refs, self.params.summary_sample_size);
      let source_type = members[0].source_type.clone();
      let request = JudgeRequest::from_records(sample.iter().copied(), Some(source_type.as_str()));

      let summary = match judge::summarize(self.judge.as_ref(), &request, &self.retry).await {
        Ok(Some(summary)) => {
          refreshed += 1;
          summary
        }
        Ok(None) => {
          fallback += 1;
          fallback_summary(&sample)
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
          bentley::warn!("Summary refresh for {cluster_id} failed, using template: {e}");
          fallback += 1;
          fallback_summary(&sample)
        }
      };
      self.store.update_cluster_summary(cluster_id, &summary.name, &summary.description).await?;
    }
    Ok((refreshed, fallback))
  }
}

fn queued_count(outcome: MirrorOutcome) -> usize {
  match outcome {
    MirrorOutcome::Synced => 0,
    MirrorOutcome::Queued => 1,
  }
}

/// Templated summary built from the members' raw problem statements
pub fn fallback_summary(members: &[&ProblemRecord]) -> ClusterSummary {
  const NAME_CHARS: usize = 60;
  const EXAMPLES: usize = 3;

  let first = members.first().map(|m| m.problem.trim()).unwrap_or_default();
  let name = if first.chars().count() > NAME_CHARS {
    format!("{}...", first.chars().take(NAME_CHARS).collect::<String>().trim_end())
  } else {
    first.to_string()
  };

  let examples: Vec<String> = members
    .iter()
    .map(|m| m.problem.trim())
    .filter(|p| !p.is_empty())
    .take(EXAMPLES)
    .map(|p| format!("\"{p}\""))
    .collect();

  ClusterSummary {
    name: if name.is_empty() { "Unnamed workflow".to_string() } else { name },
    description: format!("{} related reports, e.g. {}", members.len(), examples.join("; ")),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fallback_summary_template() {
    let at = Utc::now();
    let long = "Every month I export invoices from the billing system \
                and match them by hand against bank statements";
    let records = vec![
      ProblemRecord::new("a", "reddit", long, vec![1.0], at),
      ProblemRecord::new("b", "reddit", "Matching invoices manually", vec![1.0], at),
    ];
    let refs: Vec<&ProblemRecord> = records.iter().collect();
    let summary = fallback_summary(&refs);

    assert!(summary.name.ends_with("..."));
    assert!(summary.name.chars().count() <= 63);
    assert!(summary.description.starts_with("2 related reports"));
    assert!(summary.description.contains("\"Matching invoices manually\""));
  }

  #[test]
  fn test_fallback_summary_empty() {
    let summary = fallback_summary(&[]);
    assert_eq!(summary.name, "Unnamed workflow");
  }
}
