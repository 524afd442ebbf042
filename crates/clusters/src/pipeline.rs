//! Pipeline driver
//!
//! Wires the four components from one `ClustersConfig` and runs a full pass:
//! backlog replay, assignment (deferred records first), lifecycle
//! housekeeping, then change detection.

use bentley::journal::Journal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::assigner::{AssignmentReport, StreamingAssigner};
use crate::builder::{BatchBuilder, BatchReport};
use crate::config::ClustersConfig;
use crate::detector::{ChangeDetector, DetectOptions, DetectionReport};
use crate::index::{open_index, VectorIndex};
use crate::journal::RunJournal;
use crate::judge::http::HttpSemanticJudge;
use crate::judge::SemanticJudge;
use crate::lifecycle::{LifecycleManager, LifecycleReport};
use crate::models::ProblemRecord;
use crate::store::{ClusterStore, SqliteClusterStore};
use crate::sync::{IndexMirror, ReplayReport};
use crate::Result;

/// Outcome of one full pass
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
  pub run_id: String,
  pub backlog: ReplayReport,
  /// Deferred records from earlier passes that were retried
  pub retried_deferred: usize,
  pub assignment: AssignmentReport,
  pub lifecycle: LifecycleReport,
  pub detection: DetectionReport,
}

impl RunSummary {
  fn rows(&self) -> Vec<(&'static str, String)> {
    let a = &self.assignment;
    let l = &self.lifecycle;
    vec![
      ("run", self.run_id.clone()),
      (
        "backlog replayed",
        format!("{} ({} pending)", self.backlog.replayed, self.backlog.still_pending),
      ),
      ("deferred retried", self.retried_deferred.to_string()),
      ("merged", a.merged.to_string()),
      ("newly clustered", format!("{} in {} new clusters", a.newly_clustered, a.founded.len())),
      ("orphaned", a.orphaned.to_string()),
      ("unchanged", a.unchanged.to_string()),
      ("failed (deferred)", a.deferred.to_string()),
      ("index writes queued", (a.index_queued + l.index_queued).to_string()),
      ("orphans expired", l.expired_orphans.to_string()),
      ("clusters dissolved", l.dissolved_clusters.len().to_string()),
      ("clusters archived", l.archived_clusters.len().to_string()),
      ("change triggers", self.detection.triggers.len().to_string()),
    ]
  }
}

impl fmt::Display for RunSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", bentley::format_report("Pipeline run", &self.rows()))?;
    for trigger in &self.detection.triggers {
      writeln!(
        f,
        "  [{}] {} (Δ{}): {}",
        trigger.priority.as_str(),
        trigger.cluster_id,
        trigger.size_delta,
        trigger.reasons.join(", ")
      )?;
    }
    Ok(())
  }
}

pub struct Pipeline {
  store: Arc<dyn ClusterStore>,
  mirror: IndexMirror,
  builder: BatchBuilder,
  assigner: StreamingAssigner,
  detector: ChangeDetector,
  lifecycle: LifecycleManager,
  journal: RunJournal,
}

impl Pipeline {
  pub fn new(
    config: &ClustersConfig,
    store: Arc<dyn ClusterStore>,
    index: Arc<dyn VectorIndex>,
    judge: Arc<dyn SemanticJudge>,
    journal: RunJournal,
  ) -> Self {
    let mirror = IndexMirror::new(index, store.clone(), config.retry.clone(), journal.clone());
    let builder =
      BatchBuilder::new(config, store.clone(), judge.clone(), mirror.clone(), journal.clone());
    let assigner =
      StreamingAssigner::new(config, store.clone(), judge, mirror.clone(), journal.clone());
    Self {
      builder,
      assigner,
      detector: ChangeDetector::new(config, store.clone()),
      lifecycle: LifecycleManager::new(config, store.clone(), mirror.clone(), journal.clone()),
      store,
      mirror,
      journal,
    }
  }

  /// Open the on-disk store and journal, the configured vector index and
  /// the HTTP judge
  pub async fn open(config: &ClustersConfig) -> Result<Self> {
    let store = Arc::new(SqliteClusterStore::open(config.storage.database_path()).await?);
    let index = open_index(config, store.as_ref()).await?;
    let judge = Arc::new(HttpSemanticJudge::new(&config.judge, config.retry.judge_timeout())?);
    let journal = RunJournal::new(Journal::open(config.storage.journal_path())?);
    Ok(Self::new(config, store, index, judge, journal))
  }

  pub fn store(&self) -> &Arc<dyn ClusterStore> {
    &self.store
  }

  pub fn journal(&self) -> &RunJournal {
    &self.journal
  }

  pub fn detector(&self) -> &ChangeDetector {
    &self.detector
  }

  /// Seed clusters from a bounded pool of records
  pub async fn build(&self, records: &[ProblemRecord], now: DateTime<Utc>) -> Result<BatchReport> {
    self.mirror.replay_backlog().await?;
    self.builder.build(records, now).await
  }

  /// Route records without lifecycle or detection
  pub async fn assign(
    &self,
    records: &[ProblemRecord],
    now: DateTime<Utc>,
  ) -> Result<AssignmentReport> {
    self.mirror.replay_backlog().await?;
    self.assigner.assign_batch(records, now).await
  }

  pub async fn changes(
    &self,
    now: DateTime<Utc>,
    options: DetectOptions,
  ) -> Result<DetectionReport> {
    self.detector.detect(now, options).await
  }

  pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<LifecycleReport> {
    self.mirror.replay_backlog().await?;
    self.lifecycle.run(now).await
  }

  /// One full pass over `incoming` plus whatever earlier passes deferred
  pub async fn run(
    &self,
    incoming: &[ProblemRecord],
    now: DateTime<Utc>,
    options: DetectOptions,
  ) -> Result<RunSummary> {
    bentley::info!(
      "Pipeline run {} starting with {} incoming records",
      self.journal.run_id(),
      incoming.len()
    );

    let backlog = self.mirror.replay_backlog().await?;

    let incoming_ids: HashSet<&str> = incoming.iter().map(|r| r.id.as_str()).collect();
    let deferred_ids: Vec<String> = self
      .store
      .deferred_assignments()
      .await?
      .into_iter()
      .map(|d| d.record_id)
      .filter(|id| !incoming_ids.contains(id.as_str()))
      .collect();
    let mut records = self.store.get_problems(&deferred_ids).await?;
    let retried_deferred = records.len();
    records.extend(incoming.iter().cloned());

    let assignment = self.assigner.assign_batch(&records, now).await?;
    let lifecycle = self.lifecycle.run(now).await?;
    let detection = self.detector.detect(now, options).await?;

    Ok(RunSummary {
      run_id: self.journal.run_id().to_string(),
      backlog,
      retried_deferred,
      assignment,
      lifecycle,
      detection,
    })
  }
}
