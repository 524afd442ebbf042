//! In-process brute-force vector index

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{IndexEntry, IndexMetadata, MetadataFilter, MetadataPatch, Neighbor, VectorIndex};
use crate::similarity::cosine_similarity;
use crate::store::ClusterStore;
use crate::{ClusterError, Result};

/// Exhaustive cosine search over every stored embedding
#[derive(Default)]
pub struct MemoryVectorIndex {
  entries: RwLock<HashMap<String, IndexEntry>>,
}

impl MemoryVectorIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build an index from every problem record the store caches
  pub async fn hydrate(store: &dyn ClusterStore) -> Result<Self> {
    let index = Self::new();
    let records = store.all_problems().await?;
    {
      let mut entries = index.entries.write().await;
      for record in &records {
        entries.insert(
          record.id.clone(),
          IndexEntry {
            id: record.id.clone(),
            embedding: record.embedding.clone(),
            metadata: IndexMetadata::from_record(record),
          },
        );
      }
    }
    bentley::verbose!("Hydrated in-memory index with {} embeddings", records.len());
    Ok(index)
  }

  pub async fn len(&self) -> usize {
    self.entries.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.entries.read().await.is_empty()
  }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
  async fn add_embedding(&self, id: &str, vector: &[f32], metadata: IndexMetadata) -> Result<()> {
    let entry = IndexEntry { id: id.to_string(), embedding: vector.to_vec(), metadata };
    self.entries.write().await.insert(id.to_string(), entry);
    Ok(())
  }

  async fn query_nearest(
    &self,
    vector: &[f32],
    k: usize,
    filter: &MetadataFilter,
  ) -> Result<Vec<Neighbor>> {
    let entries = self.entries.read().await;
    let mut hits: Vec<Neighbor> = entries
      .values()
      .filter(|entry| filter.matches(&entry.id, &entry.metadata))
      .map(|entry| Neighbor {
        id: entry.id.clone(),
        similarity: cosine_similarity(vector, &entry.embedding),
        metadata: entry.metadata.clone(),
      })
      .filter(|hit| filter.passes_similarity(hit.similarity))
      .collect();

    hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(k);
    Ok(hits)
  }

  async fn patch_metadata(&self, id: &str, patch: &MetadataPatch) -> Result<()> {
    let mut entries = self.entries.write().await;
    let entry = entries.get_mut(id).ok_or_else(|| ClusterError::NotFound(format!("index entry {id}")))?;
    entry.metadata.apply(patch);
    Ok(())
  }

  async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
    let mut entries = self.entries.write().await;
    for id in ids {
      entries.remove(id);
    }
    Ok(())
  }

  async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<IndexEntry>> {
    let entries = self.entries.read().await;
    Ok(ids.iter().filter_map(|id| entries.get(id).cloned()).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{LifecycleStage, Placement};
  use chrono::Utc;

  fn meta(stage: Option<LifecycleStage>, cluster: Option<&str>) -> IndexMetadata {
    IndexMetadata {
      cluster_id: cluster.map(str::to_string),
      lifecycle_stage: stage,
      source_type: "reddit".to_string(),
      extracted_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn test_query_orders_by_similarity_and_filters() {
    let index = MemoryVectorIndex::new();
    index.add_embedding("near", &[1.0, 0.05], meta(Some(LifecycleStage::Active), Some("c_01"))).await.unwrap();
    index.add_embedding("mid", &[1.0, 0.6], meta(Some(LifecycleStage::Active), Some("c_01"))).await.unwrap();
    index.add_embedding("orphan", &[1.0, 0.0], meta(Some(LifecycleStage::Orphan), None)).await.unwrap();

    let hits = index.query_nearest(&[1.0, 0.0], 10, &MetadataFilter::active()).await.unwrap();
    let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["near", "mid"]);

    let hits = index.query_nearest(&[1.0, 0.0], 1, &MetadataFilter::default()).await.unwrap();
    assert_eq!(hits[0].id, "orphan");
  }

  #[tokio::test]
  async fn test_min_similarity_filter() {
    let index = MemoryVectorIndex::new();
    index.add_embedding("close", &[1.0, 0.1], meta(Some(LifecycleStage::Orphan), None)).await.unwrap();
    index.add_embedding("far", &[0.0, 1.0], meta(Some(LifecycleStage::Orphan), None)).await.unwrap();

    let filter = MetadataFilter::orphans().min_similarity(0.7);
    let hits = index.query_nearest(&[1.0, 0.0], 10, &filter).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "close");
  }

  #[tokio::test]
  async fn test_patch_missing_entry_is_not_found() {
    let index = MemoryVectorIndex::new();
    let patch = MetadataPatch::placement(Some(&Placement::active("c_01")));
    let err = index.patch_metadata("ghost", &patch).await.unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));
  }

  #[tokio::test]
  async fn test_delete_and_get() {
    let index = MemoryVectorIndex::new();
    index.add_embedding("a", &[1.0], meta(None, None)).await.unwrap();
    index.add_embedding("b", &[1.0], meta(None, None)).await.unwrap();
    index.delete_by_ids(&["a".to_string(), "zzz".to_string()]).await.unwrap();

    let found = index.get_by_ids(&["a".to_string(), "b".to_string()]).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "b");
    assert_eq!(index.len().await, 1);
  }
}
