//! Configuration for the clusters engine
//!
//! Every tuning constant the pipeline uses lives here. A `ClustersConfig` is
//! built once at startup and handed to each component's constructor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;
use crate::{ClusterError, Result};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClustersConfig {
  /// Minimum membership for a group to become (and remain) a cluster
  #[serde(default = "default_quorum")]
  pub quorum: usize,
  #[serde(default)]
  pub builder: BuilderConfig,
  #[serde(default)]
  pub assigner: AssignerConfig,
  #[serde(default)]
  pub detector: DetectorConfig,
  #[serde(default)]
  pub lifecycle: LifecycleConfig,
  #[serde(default)]
  pub judge: JudgeConfig,
  #[serde(default)]
  pub retry: RetryPolicy,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub index: IndexConfig,
}

/// Batch DBSCAN clustering parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
  /// Neighborhood radius in cosine distance
  #[serde(default = "default_eps")]
  pub eps: f32,
  /// Neighbors (including the point itself) needed for a core point
  #[serde(default = "default_min_samples")]
  pub min_samples: usize,
  /// Groups larger than this are sampled before validation
  #[serde(default = "default_max_group_size")]
  pub max_group_size: usize,
  /// Minimum judge similarity score to accept a group
  #[serde(default = "default_workflow_similarity_threshold")]
  pub workflow_similarity_threshold: f32,
}

/// Streaming assignment parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignerConfig {
  #[serde(default = "default_neighbor_k")]
  pub neighbor_k: usize,
  /// Minimum boosted score to merge into an existing cluster
  #[serde(default = "default_merge_threshold")]
  pub merge_threshold: f32,
  /// Divisor of the `ln(size + 1)` size boost
  #[serde(default = "default_size_boost_divisor")]
  pub size_boost_divisor: f32,
  #[serde(default = "default_orphan_similarity_threshold")]
  pub orphan_similarity_threshold: f32,
  #[serde(default = "default_orphan_window_hours")]
  pub orphan_window_hours: i64,
  #[serde(default = "default_orphan_query_limit")]
  pub orphan_query_limit: usize,
  /// Members sent to the judge when regenerating a cluster summary
  #[serde(default = "default_summary_sample_size")]
  pub summary_sample_size: usize,
}

/// Change detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
  #[serde(default = "default_min_size_delta")]
  pub min_size_delta: i64,
  #[serde(default = "default_min_size_ratio")]
  pub min_size_ratio: f64,
  #[serde(default = "default_min_author_delta")]
  pub min_author_delta: i64,
  #[serde(default = "default_min_community_delta")]
  pub min_community_delta: i64,
  #[serde(default = "default_refresh_after_days")]
  pub refresh_after_days: i64,
  /// Size delta at which a trigger becomes high priority
  #[serde(default = "default_high_priority_size_delta")]
  pub high_priority_size_delta: i64,
}

/// Retention windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
  #[serde(default = "default_orphan_ttl_days")]
  pub orphan_ttl_days: i64,
  #[serde(default = "default_archive_after_days")]
  pub archive_after_days: i64,
}

/// Semantic judge endpoint (OpenAI-compatible chat completions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
  #[serde(default = "default_judge_url")]
  pub base_url: String,
  #[serde(default = "default_judge_model")]
  pub model: String,
  /// Only ever read from the environment or a local file, never written back
  #[serde(default, skip_serializing)]
  pub api_key: Option<String>,
}

/// Which vector index backs the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
  /// Brute-force index rebuilt from the store on every start
  #[default]
  Memory,
  /// Persistent LanceDB table (requires the `lancedb` feature)
  Lancedb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
  #[serde(default)]
  pub backend: IndexBackend,
  /// LanceDB directory, relative to `storage.data_dir`
  #[serde(default = "default_index_dir")]
  pub directory: String,
  #[serde(default = "default_index_table")]
  pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
  #[serde(default = "default_data_dir")]
  pub data_dir: PathBuf,
  #[serde(default = "default_database_file")]
  pub database_file: String,
  #[serde(default = "default_journal_file")]
  pub journal_file: String,
}

fn default_quorum() -> usize {
  4
}
fn default_eps() -> f32 {
  0.25
}
fn default_min_samples() -> usize {
  3
}
fn default_max_group_size() -> usize {
  20
}
fn default_workflow_similarity_threshold() -> f32 {
  0.7
}
fn default_neighbor_k() -> usize {
  50
}
fn default_merge_threshold() -> f32 {
  0.75
}
fn default_size_boost_divisor() -> f32 {
  10.0
}
fn default_orphan_similarity_threshold() -> f32 {
  0.7
}
fn default_orphan_window_hours() -> i64 {
  24
}
fn default_orphan_query_limit() -> usize {
  50
}
fn default_summary_sample_size() -> usize {
  20
}
fn default_min_size_delta() -> i64 {
  5
}
fn default_min_size_ratio() -> f64 {
  0.10
}
fn default_min_author_delta() -> i64 {
  3
}
fn default_min_community_delta() -> i64 {
  2
}
fn default_refresh_after_days() -> i64 {
  7
}
fn default_high_priority_size_delta() -> i64 {
  20
}
fn default_orphan_ttl_days() -> i64 {
  14
}
fn default_archive_after_days() -> i64 {
  90
}
fn default_judge_url() -> String {
  "http://localhost:11434/v1".to_string()
}
fn default_judge_model() -> String {
  "gpt-4o-mini".to_string()
}
fn default_data_dir() -> PathBuf {
  dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("clusters")
}
fn default_database_file() -> String {
  "clusters.db".to_string()
}
fn default_journal_file() -> String {
  "journal.jsonl".to_string()
}
fn default_index_dir() -> String {
  "vectors".to_string()
}
fn default_index_table() -> String {
  "problems".to_string()
}

impl Default for ClustersConfig {
  fn default() -> Self {
    Self {
      quorum: default_quorum(),
      builder: BuilderConfig::default(),
      assigner: AssignerConfig::default(),
      detector: DetectorConfig::default(),
      lifecycle: LifecycleConfig::default(),
      judge: JudgeConfig::default(),
      retry: RetryPolicy::default(),
      storage: StorageConfig::default(),
      index: IndexConfig::default(),
    }
  }
}

impl Default for BuilderConfig {
  fn default() -> Self {
    Self {
      eps: default_eps(),
      min_samples: default_min_samples(),
      max_group_size: default_max_group_size(),
      workflow_similarity_threshold: default_workflow_similarity_threshold(),
    }
  }
}

impl Default for AssignerConfig {
  fn default() -> Self {
    Self {
      neighbor_k: default_neighbor_k(),
      merge_threshold: default_merge_threshold(),
      size_boost_divisor: default_size_boost_divisor(),
      orphan_similarity_threshold: default_orphan_similarity_threshold(),
      orphan_window_hours: default_orphan_window_hours(),
      orphan_query_limit: default_orphan_query_limit(),
      summary_sample_size: default_summary_sample_size(),
    }
  }
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      min_size_delta: default_min_size_delta(),
      min_size_ratio: default_min_size_ratio(),
      min_author_delta: default_min_author_delta(),
      min_community_delta: default_min_community_delta(),
      refresh_after_days: default_refresh_after_days(),
      high_priority_size_delta: default_high_priority_size_delta(),
    }
  }
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self { orphan_ttl_days: default_orphan_ttl_days(), archive_after_days: default_archive_after_days() }
  }
}

impl Default for JudgeConfig {
  fn default() -> Self {
    Self { base_url: default_judge_url(), model: default_judge_model(), api_key: None }
  }
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      data_dir: default_data_dir(),
      database_file: default_database_file(),
      journal_file: default_journal_file(),
    }
  }
}

impl Default for IndexConfig {
  fn default() -> Self {
    Self {
      backend: IndexBackend::default(),
      directory: default_index_dir(),
      table_name: default_index_table(),
    }
  }
}

impl StorageConfig {
  pub fn database_path(&self) -> PathBuf {
    self.data_dir.join(&self.database_file)
  }

  pub fn journal_path(&self) -> PathBuf {
    self.data_dir.join(&self.journal_file)
  }
}

impl ClustersConfig {
  pub fn index_path(&self) -> PathBuf {
    self.storage.data_dir.join(&self.index.directory)
  }
}

impl ClustersConfig {
  /// Load configuration from a YAML or JSON file, chosen by extension
  pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let config = match path.extension().and_then(|ext| ext.to_str()) {
      Some("json") => serde_json::from_str(&content)?,
      Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
        .map_err(|e| ClusterError::Config(format!("{}: {e}", path.display())))?,
      _ => {
        return Err(ClusterError::Config(format!(
          "unsupported config format: {} (expected .yaml, .yml or .json)",
          path.display()
        )))
      }
    };
    Ok(config)
  }

  /// Load from an explicit path or the defaults, apply the environment, and validate
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let mut config = match path {
      Some(path) => Self::load_from_file(path)?,
      None => Self::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
  }

  /// Environment variables take precedence over file values
  pub fn apply_env(&mut self) {
    if let Ok(url) = std::env::var("CLUSTERS_JUDGE_URL") {
      self.judge.base_url = url;
    }
    if let Ok(model) = std::env::var("CLUSTERS_JUDGE_MODEL") {
      self.judge.model = model;
    }
    if let Ok(key) = std::env::var("CLUSTERS_JUDGE_API_KEY") {
      if !key.trim().is_empty() {
        self.judge.api_key = Some(key);
      }
    }
    if let Ok(dir) = std::env::var("CLUSTERS_DATA_DIR") {
      self.storage.data_dir = PathBuf::from(dir);
    }
  }

  /// Reject values the pipeline cannot run with
  pub fn validate(&self) -> Result<()> {
    fn unit(name: &str, value: f32) -> Result<()> {
      if (0.0..=1.0).contains(&value) {
        Ok(())
      } else {
        Err(ClusterError::Config(format!("{name} must be within [0, 1], got {value}")))
      }
    }
    fn positive(name: &str, value: i64) -> Result<()> {
      if value > 0 {
        Ok(())
      } else {
        Err(ClusterError::Config(format!("{name} must be positive, got {value}")))
      }
    }

    if self.quorum < 2 {
      return Err(ClusterError::Config(format!("quorum must be at least 2, got {}", self.quorum)));
    }
    if self.builder.max_group_size < self.quorum {
      return Err(ClusterError::Config(format!(
        "builder.max_group_size ({}) is below quorum ({})",
        self.builder.max_group_size, self.quorum
      )));
    }
    if !(self.builder.eps > 0.0 && self.builder.eps <= 2.0) {
      return Err(ClusterError::Config(format!(
        "builder.eps must be within (0, 2], got {}",
        self.builder.eps
      )));
    }
    if self.builder.min_samples == 0 {
      return Err(ClusterError::Config("builder.min_samples must be at least 1".to_string()));
    }
    unit("builder.workflow_similarity_threshold", self.builder.workflow_similarity_threshold)?;
    unit("assigner.orphan_similarity_threshold", self.assigner.orphan_similarity_threshold)?;
    if self.assigner.neighbor_k == 0 || self.assigner.orphan_query_limit == 0 {
      return Err(ClusterError::Config(
        "assigner.neighbor_k and assigner.orphan_query_limit must be at least 1".to_string(),
      ));
    }
    if self.assigner.size_boost_divisor <= 0.0 {
      return Err(ClusterError::Config("assigner.size_boost_divisor must be positive".to_string()));
    }
    positive("assigner.orphan_window_hours", self.assigner.orphan_window_hours)?;
    positive("detector.min_size_delta", self.detector.min_size_delta)?;
    positive("detector.refresh_after_days", self.detector.refresh_after_days)?;
    positive("lifecycle.orphan_ttl_days", self.lifecycle.orphan_ttl_days)?;
    positive("lifecycle.archive_after_days", self.lifecycle.archive_after_days)?;
    if self.retry.max_attempts == 0 {
      return Err(ClusterError::Config("retry.max_attempts must be at least 1".to_string()));
    }
    if self.judge.base_url.trim().is_empty() {
      return Err(ClusterError::Config("judge.base_url is required".to_string()));
    }
    if self.index.backend == IndexBackend::Lancedb {
      if !cfg!(feature = "lancedb") {
        return Err(ClusterError::Config(
          "index.backend 'lancedb' needs a build with the lancedb feature".to_string(),
        ));
      }
      if self.index.table_name.trim().is_empty() {
        return Err(ClusterError::Config("index.table_name is required".to_string()));
      }
    }
    Ok(())
  }
}
