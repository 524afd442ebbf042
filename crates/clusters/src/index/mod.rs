//! Vector similarity index abstraction
//!
//! The index holds a read-mostly replica of each problem record's embedding
//! plus the metadata the assigner filters on. The cluster store stays the
//! source of truth; everything written here is mirrored from it.

pub mod memory;

#[cfg(feature = "lancedb")]
pub mod lancedb;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ClustersConfig, IndexBackend};
use crate::models::{LifecycleStage, Placement, ProblemRecord};
use crate::store::ClusterStore;
use crate::Result;

pub use memory::MemoryVectorIndex;

/// Metadata stored alongside each embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
  pub cluster_id: Option<String>,
  pub lifecycle_stage: Option<LifecycleStage>,
  pub source_type: String,
  pub extracted_at: DateTime<Utc>,
}

impl IndexMetadata {
  pub fn from_record(record: &ProblemRecord) -> Self {
    Self {
      cluster_id: record.cluster_id().map(str::to_string),
      lifecycle_stage: record.lifecycle_stage(),
      source_type: record.source_type.clone(),
      extracted_at: record.extracted_at,
    }
  }

  pub fn apply(&mut self, patch: &MetadataPatch) {
    if let Some(cluster_id) = &patch.cluster_id {
      self.cluster_id = cluster_id.clone();
    }
    if let Some(stage) = patch.lifecycle_stage {
      self.lifecycle_stage = stage;
    }
  }
}

/// Partial metadata update; `None` leaves a field untouched, `Some(None)` clears it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
  pub cluster_id: Option<Option<String>>,
  pub lifecycle_stage: Option<Option<LifecycleStage>>,
}

impl MetadataPatch {
  /// Patch that writes the cluster id and stage together
  pub fn placement(placement: Option<&Placement>) -> Self {
    Self {
      cluster_id: Some(placement.and_then(Placement::cluster_id).map(str::to_string)),
      lifecycle_stage: Some(placement.map(Placement::stage)),
    }
  }
}

/// Metadata filter for nearest-neighbor queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
  pub lifecycle_stage: Option<LifecycleStage>,
  pub exclude_ids: Vec<String>,
  /// Inclusive `extracted_at` window
  pub extracted_between: Option<(DateTime<Utc>, DateTime<Utc>)>,
  pub min_similarity: Option<f32>,
}

impl MetadataFilter {
  pub fn active() -> Self {
    Self { lifecycle_stage: Some(LifecycleStage::Active), ..Self::default() }
  }

  pub fn orphans() -> Self {
    Self { lifecycle_stage: Some(LifecycleStage::Orphan), ..Self::default() }
  }

  pub fn excluding(mut self, id: &str) -> Self {
    self.exclude_ids.push(id.to_string());
    self
  }

  pub fn extracted_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
    self.extracted_between = Some((from, to));
    self
  }

  pub fn min_similarity(mut self, threshold: f32) -> Self {
    self.min_similarity = Some(threshold);
    self
  }

  /// Metadata-only part of the filter (similarity is checked by the caller)
  pub fn matches(&self, id: &str, metadata: &IndexMetadata) -> bool {
    if let Some(stage) = self.lifecycle_stage {
      if metadata.lifecycle_stage != Some(stage) {
        return false;
      }
    }
    if let Some((from, to)) = self.extracted_between {
      if metadata.extracted_at < from || metadata.extracted_at > to {
        return false;
      }
    }
    !self.exclude_ids.iter().any(|excluded| excluded == id)
  }

  pub fn passes_similarity(&self, similarity: f32) -> bool {
    self.min_similarity.map(|threshold| similarity >= threshold).unwrap_or(true)
  }
}

/// One nearest-neighbor hit
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
  pub id: String,
  /// Cosine similarity to the query vector
  pub similarity: f32,
  pub metadata: IndexMetadata,
}

/// A stored embedding with its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
  pub id: String,
  pub embedding: Vec<f32>,
  pub metadata: IndexMetadata,
}

/// Nearest-neighbor index over problem embeddings
#[async_trait]
pub trait VectorIndex: Send + Sync {
  /// Insert or replace the embedding and metadata for `id`
  async fn add_embedding(&self, id: &str, vector: &[f32], metadata: IndexMetadata) -> Result<()>;

  /// Up to `k` neighbors passing `filter`, most similar first
  async fn query_nearest(
    &self,
    vector: &[f32],
    k: usize,
    filter: &MetadataFilter,
  ) -> Result<Vec<Neighbor>>;

  /// Patch metadata in place; `ClusterError::NotFound` when `id` is absent
  async fn patch_metadata(&self, id: &str, patch: &MetadataPatch) -> Result<()>;

  /// Remove entries; unknown ids are ignored
  async fn delete_by_ids(&self, ids: &[String]) -> Result<()>;

  async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<IndexEntry>>;
}

/// Open the configured backend, brought level with the store
pub async fn open_index(
  config: &ClustersConfig,
  store: &dyn ClusterStore,
) -> Result<Arc<dyn VectorIndex>> {
  match config.index.backend {
    IndexBackend::Memory => Ok(Arc::new(MemoryVectorIndex::hydrate(store).await?)),
    IndexBackend::Lancedb => open_lancedb(config, store).await,
  }
}

#[cfg(feature = "lancedb")]
async fn open_lancedb(
  config: &ClustersConfig,
  store: &dyn ClusterStore,
) -> Result<Arc<dyn VectorIndex>> {
  let path = config.index_path();
  let index = self::lancedb::LanceDbVectorIndex::open(&path, &config.index.table_name).await?;
  let written = backfill(&index, store).await?;
  if written > 0 {
    bentley::info!("Backfilled {written} embeddings into {}", path.display());
  }
  Ok(Arc::new(index))
}

#[cfg(not(feature = "lancedb"))]
async fn open_lancedb(
  _config: &ClustersConfig,
  _store: &dyn ClusterStore,
) -> Result<Arc<dyn VectorIndex>> {
  Err(crate::ClusterError::Config(
    "index.backend 'lancedb' needs a build with the lancedb feature".to_string(),
  ))
}

/// Write every stored record the index is missing or holds stale metadata for.
/// Returns the number of entries written.
pub async fn backfill(index: &dyn VectorIndex, store: &dyn ClusterStore) -> Result<usize> {
  let records = store.all_problems().await?;
  let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
  let indexed: HashMap<String, IndexMetadata> =
    index.get_by_ids(&ids).await?.into_iter().map(|e| (e.id, e.metadata)).collect();

  let mut written = 0;
  for record in &records {
    let metadata = IndexMetadata::from_record(record);
    if indexed.get(&record.id) == Some(&metadata) {
      continue;
    }
    index.add_embedding(&record.id, &record.embedding, metadata).await?;
    written += 1;
  }
  Ok(written)
}
