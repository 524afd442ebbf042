use async_trait::async_trait;
use bentley::journal::Journal;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use clusters::index::{
  IndexEntry, IndexMetadata, MemoryVectorIndex, MetadataFilter, MetadataPatch, Neighbor,
  VectorIndex,
};
use clusters::journal::RunJournal;
use clusters::judge::{Assessment, ClusterSummary, JudgeRequest, JudgeResponse, SemanticJudge};
use clusters::pipeline::Pipeline;
use clusters::retry::RetryPolicy;
use clusters::store::{ClusterStore, SqliteClusterStore};
use clusters::sync::IndexMirror;
use clusters::{ClusterError, ClustersConfig, ProblemRecord, Result};

/// How the fake judge answers group assessments
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(dead_code)]
pub enum JudgeMode {
  Accept(f32),
  Reject,
  /// Transport failure, as if the service were down
  Fail,
}

/// Scripted semantic judge
pub struct FakeJudge {
  mode: Mutex<JudgeMode>,
  pub summaries_enabled: AtomicBool,
  pub assess_calls: AtomicUsize,
  pub summary_calls: AtomicUsize,
  pub last_group_size: AtomicUsize,
}

#[allow(dead_code)]
impl FakeJudge {
  pub fn new(mode: JudgeMode) -> Self {
    Self {
      mode: Mutex::new(mode),
      summaries_enabled: AtomicBool::new(true),
      assess_calls: AtomicUsize::new(0),
      summary_calls: AtomicUsize::new(0),
      last_group_size: AtomicUsize::new(0),
    }
  }

  pub fn set_mode(&self, mode: JudgeMode) {
    *self.mode.lock().unwrap() = mode;
  }

  pub fn assess_calls(&self) -> usize {
    self.assess_calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl SemanticJudge for FakeJudge {
  async fn assess_group(&self, request: &JudgeRequest) -> Result<Assessment> {
    self.assess_calls.fetch_add(1, Ordering::SeqCst);
    self.last_group_size.store(request.items.len(), Ordering::SeqCst);

    let mode = *self.mode.lock().unwrap();
    match mode {
      JudgeMode::Accept(score) => Ok(Assessment::Response(JudgeResponse {
        is_valid_cluster: true,
        similarity_score: score,
        name: "Manual invoice reconciliation".to_string(),
        description: "Finance teams matching invoices to payments by hand".to_string(),
        confidence: 0.9,
        reasoning: "same workflow".to_string(),
      })),
      JudgeMode::Reject => Ok(Assessment::Response(JudgeResponse {
        is_valid_cluster: false,
        similarity_score: 0.3,
        reasoning: "different workflows".to_string(),
        ..JudgeResponse::default()
      })),
      JudgeMode::Fail => Err(ClusterError::Transport("connection refused".to_string())),
    }
  }

  async fn summarize_cluster(&self, request: &JudgeRequest) -> Result<Option<ClusterSummary>> {
    self.summary_calls.fetch_add(1, Ordering::SeqCst);
    if !self.summaries_enabled.load(Ordering::SeqCst) {
      return Err(ClusterError::Transport("connection refused".to_string()));
    }
    Ok(Some(ClusterSummary {
      name: "Invoice reconciliation".to_string(),
      description: format!("{} reports of matching invoices by hand", request.items.len()),
    }))
  }
}

/// In-memory index whose writes can be made to fail on demand
#[derive(Default)]
pub struct FlakyIndex {
  inner: MemoryVectorIndex,
  pub failing: AtomicBool,
}

#[allow(dead_code)]
impl FlakyIndex {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  fn check(&self) -> Result<()> {
    if self.failing.load(Ordering::SeqCst) {
      Err(ClusterError::Index("index unavailable".to_string()))
    } else {
      Ok(())
    }
  }

  pub async fn metadata(&self, id: &str) -> Option<IndexMetadata> {
    self.inner.get_by_ids(&[id.to_string()]).await.unwrap().pop().map(|e| e.metadata)
  }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
  async fn add_embedding(&self, id: &str, vector: &[f32], metadata: IndexMetadata) -> Result<()> {
    self.check()?;
    self.inner.add_embedding(id, vector, metadata).await
  }

  async fn query_nearest(
    &self,
    vector: &[f32],
    k: usize,
    filter: &MetadataFilter,
  ) -> Result<Vec<Neighbor>> {
    self.inner.query_nearest(vector, k, filter).await
  }

  async fn patch_metadata(&self, id: &str, patch: &MetadataPatch) -> Result<()> {
    self.check()?;
    self.inner.patch_metadata(id, patch).await
  }

  async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
    self.check()?;
    self.inner.delete_by_ids(ids).await
  }

  async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<IndexEntry>> {
    self.inner.get_by_ids(ids).await
  }
}

/// Everything a pipeline test needs, wired over an in-memory store
#[allow(dead_code)]
pub struct Harness {
  pub config: ClustersConfig,
  pub store: Arc<SqliteClusterStore>,
  pub index: Arc<FlakyIndex>,
  pub judge: Arc<FakeJudge>,
  pub journal: Journal,
  pub pipeline: Pipeline,
  _dir: TempDir,
}

#[allow(dead_code)]
impl Harness {
  pub async fn new(mode: JudgeMode) -> Self {
    let config = test_config();
    let store = Arc::new(SqliteClusterStore::in_memory().await.unwrap());
    let index = Arc::new(FlakyIndex::new());
    let judge = Arc::new(FakeJudge::new(mode));
    let dir = TempDir::new().unwrap();
    let journal = Journal::open_with_silent(dir.path().join("journal.jsonl"), true).unwrap();
    let run = RunJournal::new(journal.clone());
    let pipeline = Pipeline::new(&config, store.clone(), index.clone(), judge.clone(), run);
    Self { config, store, index, judge, journal, pipeline, _dir: dir }
  }

  pub fn mirror(&self) -> IndexMirror {
    let retry = self.config.retry.clone();
    IndexMirror::new(self.index.clone(), self.store.clone(), retry, RunJournal::disabled())
  }

  /// Every stored record's index entry agrees with its stored placement
  pub async fn assert_index_matches_store(&self) {
    for record in self.store.all_problems().await.unwrap() {
      let metadata = self.index.metadata(&record.id).await;
      let metadata = metadata.unwrap_or_else(|| panic!("{} missing from index", record.id));
      assert_eq!(metadata.cluster_id.as_deref(), record.cluster_id(), "{}", record.id);
      assert_eq!(metadata.lifecycle_stage, record.lifecycle_stage(), "{}", record.id);
    }
  }

  /// Stage, cluster id and orphan timestamp agree for every stored record
  pub async fn assert_placement_invariant(&self) {
    for record in self.store.all_problems().await.unwrap() {
      let active = record.lifecycle_stage() == Some(clusters::LifecycleStage::Active);
      assert_eq!(active, record.cluster_id().is_some(), "{}", record.id);
      assert_eq!(record.cluster_id().is_some(), record.orphan_since().is_none(), "{}", record.id);
    }
  }

  pub async fn assert_clusters_meet_quorum(&self) {
    for cluster in self.store.list_clusters(true).await.unwrap() {
      assert!(cluster.size() >= self.config.quorum, "{} has {} members", cluster.id, cluster.size());
    }
  }
}

/// Defaults with no retry delays
pub fn test_config() -> ClustersConfig {
  ClustersConfig { retry: RetryPolicy::immediate(), ..ClustersConfig::default() }
}

pub fn now() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

/// A record near the "invoice reconciliation" direction; `i` perturbs it slightly
#[allow(dead_code)]
pub fn invoice_record(id: &str, i: usize, age: Duration) -> ProblemRecord {
  let embedding = vec![1.0, 0.02 * i as f32, 0.01];
  let problem = "I reconcile invoices against bank payments by hand";
  ProblemRecord::new(id, "reddit", problem, embedding, now() - age)
    .with_post(&format!("post{i}"))
    .with_author(&format!("author{}", i % 5))
    .with_community("r/accounting")
    .with_frequency("every week")
    .with_details("Month-end close", "Spreadsheet lookups across two exports")
}

/// A record pointing somewhere unrelated to invoices
#[allow(dead_code)]
pub fn unrelated_record(id: &str, age: Duration) -> ProblemRecord {
  ProblemRecord::new(id, "reddit", "My 3D printer clogs", vec![0.0, 0.0, 1.0], now() - age)
}
