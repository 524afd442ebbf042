//! LanceDB-backed vector index
//!
//! One table of problem embeddings with the filterable metadata stored as
//! plain columns. The table is created lazily from the first embedding, which
//! fixes the vector dimension.

use arrow::array::{
  Array, ArrayRef, FixedSizeListArray, FixedSizeListBuilder, Float32Array, Float32Builder,
  Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchIterator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Table};
use std::path::Path;
use std::sync::Arc;

use super::{IndexEntry, IndexMetadata, MetadataFilter, MetadataPatch, Neighbor, VectorIndex};
use crate::models::LifecycleStage;
use crate::{ClusterError, Result};

pub struct LanceDbVectorIndex {
  connection: Connection,
  table_name: String,
}

fn index_error(context: &str) -> impl Fn(lancedb::Error) -> ClusterError + '_ {
  move |e| ClusterError::Index(format!("{context}: {e}"))
}

/// Quote a value for a LanceDB SQL predicate
fn quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', "''"))
}

fn id_list(ids: &[String]) -> String {
  ids.iter().map(|id| quote(id)).collect::<Vec<_>>().join(", ")
}

impl LanceDbVectorIndex {
  /// Connect to (creating if needed) a LanceDB directory
  pub async fn open(data_dir: &Path, table_name: &str) -> Result<Self> {
    std::fs::create_dir_all(data_dir)?;
    let connection = connect(&data_dir.to_string_lossy())
      .execute()
      .await
      .map_err(index_error("failed to connect to LanceDB"))?;
    Ok(Self { connection, table_name: table_name.to_string() })
  }

  async fn table(&self) -> Result<Option<Table>> {
    let tables =
      self.connection.table_names().execute().await.map_err(index_error("failed to list tables"))?;
    if !tables.contains(&self.table_name) {
      return Ok(None);
    }
    let table = self
      .connection
      .open_table(&self.table_name)
      .execute()
      .await
      .map_err(index_error("failed to open table"))?;
    Ok(Some(table))
  }

  async fn contains(&self, table: &Table, id: &str) -> Result<bool> {
    let count = table
      .count_rows(Some(format!("id = {}", quote(id))))
      .await
      .map_err(index_error("failed to count rows"))?;
    Ok(count > 0)
  }
}

/// Arrow schema for a given embedding dimension
fn schema(dimension: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("source_type", DataType::Utf8, false),
    Field::new("cluster_id", DataType::Utf8, true),
    Field::new("lifecycle_stage", DataType::Utf8, true),
    Field::new("extracted_at", DataType::Int64, false),
    Field::new(
      "embedding",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dimension as i32),
      false,
    ),
  ]))
}

/// Single-row batch for one embedding
fn entry_batch(id: &str, vector: &[f32], metadata: &IndexMetadata) -> Result<RecordBatch> {
  let mut embedding =
    FixedSizeListBuilder::new(Float32Builder::with_capacity(vector.len()), vector.len() as i32);
  embedding.values().append_slice(vector);
  embedding.append(true);

  let columns: Vec<ArrayRef> = vec![
    Arc::new(StringArray::from(vec![Some(id)])),
    Arc::new(StringArray::from(vec![Some(metadata.source_type.as_str())])),
    Arc::new(StringArray::from(vec![metadata.cluster_id.as_deref()])),
    Arc::new(StringArray::from(vec![metadata.lifecycle_stage.map(|s| s.as_str())])),
    Arc::new(Int64Array::from(vec![metadata.extracted_at.timestamp_millis()])),
    Arc::new(embedding.finish()),
  ];

  RecordBatch::try_new(schema(vector.len()), columns)
    .map_err(|e| ClusterError::Index(format!("failed to build record batch: {e}")))
}

/// SQL predicate for the metadata part of a filter
fn predicate(filter: &MetadataFilter) -> Option<String> {
  let mut clauses = Vec::new();
  if let Some(stage) = filter.lifecycle_stage {
    clauses.push(format!("lifecycle_stage = {}", quote(stage.as_str())));
  }
  if !filter.exclude_ids.is_empty() {
    clauses.push(format!("id NOT IN ({})", id_list(&filter.exclude_ids)));
  }
  if let Some((from, to)) = filter.extracted_between {
    clauses.push(format!(
      "extracted_at >= {} AND extracted_at <= {}",
      from.timestamp_millis(),
      to.timestamp_millis()
    ));
  }
  if clauses.is_empty() {
    None
  } else {
    Some(clauses.join(" AND "))
  }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
  batch
    .column_by_name(name)
    .and_then(|col| col.as_any().downcast_ref::<StringArray>())
    .ok_or_else(|| ClusterError::Index(format!("missing '{name}' column")))
}

fn optional_string(array: &StringArray, row: usize) -> Option<String> {
  if array.is_null(row) {
    None
  } else {
    Some(array.value(row).to_string())
  }
}

/// Metadata for every row of a result batch
fn batch_metadata(batch: &RecordBatch) -> Result<Vec<(String, IndexMetadata)>> {
  let ids = string_column(batch, "id")?;
  let sources = string_column(batch, "source_type")?;
  let clusters = string_column(batch, "cluster_id")?;
  let stages = string_column(batch, "lifecycle_stage")?;
  let extracted = batch
    .column_by_name("extracted_at")
    .and_then(|col| col.as_any().downcast_ref::<Int64Array>())
    .ok_or_else(|| ClusterError::Index("missing 'extracted_at' column".to_string()))?;

  (0..batch.num_rows())
    .map(|row| {
      let extracted_at = DateTime::<Utc>::from_timestamp_millis(extracted.value(row))
        .ok_or_else(|| ClusterError::Index(format!("bad timestamp in row {row}")))?;
      Ok((
        ids.value(row).to_string(),
        IndexMetadata {
          cluster_id: optional_string(clusters, row),
          lifecycle_stage: optional_string(stages, row).as_deref().and_then(LifecycleStage::parse),
          source_type: sources.value(row).to_string(),
          extracted_at,
        },
      ))
    })
    .collect()
}

fn batch_embeddings(batch: &RecordBatch) -> Result<Vec<Vec<f32>>> {
  let lists = batch
    .column_by_name("embedding")
    .and_then(|col| col.as_any().downcast_ref::<FixedSizeListArray>())
    .ok_or_else(|| ClusterError::Index("missing 'embedding' column".to_string()))?;

  (0..lists.len())
    .map(|row| {
      let values = lists.value(row);
      values
        .as_any()
        .downcast_ref::<Float32Array>()
        .map(|floats| floats.values().to_vec())
        .ok_or_else(|| ClusterError::Index("embedding is not float32".to_string()))
    })
    .collect()
}

#[async_trait]
impl VectorIndex for LanceDbVectorIndex {
  async fn add_embedding(&self, id: &str, vector: &[f32], metadata: IndexMetadata) -> Result<()> {
    let batch = entry_batch(id, vector, &metadata)?;
    let batch_schema = batch.schema();
    let rows = RecordBatchIterator::new(vec![Ok(batch)], batch_schema);

    match self.table().await? {
      Some(table) => {
        // Replace semantics: drop any previous row for the id first
        table.delete(&format!("id = {}", quote(id))).await.map_err(index_error("failed to delete row"))?;
        table.add(rows).execute().await.map_err(index_error("failed to add embedding"))?;
      }
      None => {
        self
          .connection
          .create_table(&self.table_name, rows)
          .execute()
          .await
          .map_err(index_error("failed to create table"))?;
        bentley::info!("Created index table '{}' ({} dimensions)", self.table_name, vector.len());
      }
    }
    Ok(())
  }

  async fn query_nearest(
    &self,
    vector: &[f32],
    k: usize,
    filter: &MetadataFilter,
  ) -> Result<Vec<Neighbor>> {
    let Some(table) = self.table().await? else {
      return Ok(Vec::new());
    };

    let mut query = table
      .vector_search(vector)
      .map_err(index_error("invalid query vector"))?
      .column("embedding")
      .distance_type(DistanceType::Cosine)
      .limit(k);
    if let Some(sql) = predicate(filter) {
      query = query.only_if(sql);
    }

    let batches: Vec<RecordBatch> = query
      .execute()
      .await
      .map_err(index_error("vector search failed"))?
      .try_collect()
      .await
      .map_err(index_error("failed to read search results"))?;

    let mut neighbors = Vec::new();
    for batch in &batches {
      let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());
      for (row, (id, metadata)) in batch_metadata(batch)?.into_iter().enumerate() {
        let distance = distances.map(|d| d.value(row)).unwrap_or(1.0);
        let similarity = 1.0 - distance;
        if filter.passes_similarity(similarity) {
          neighbors.push(Neighbor { id, similarity, metadata });
        }
      }
    }
    neighbors.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.id.cmp(&b.id)));
    neighbors.truncate(k);
    Ok(neighbors)
  }

  async fn patch_metadata(&self, id: &str, patch: &MetadataPatch) -> Result<()> {
    let Some(table) = self.table().await? else {
      return Err(ClusterError::NotFound(format!("index entry {id}")));
    };
    if !self.contains(&table, id).await? {
      return Err(ClusterError::NotFound(format!("index entry {id}")));
    }

    let sql_value = |value: Option<&str>| value.map(quote).unwrap_or_else(|| "NULL".to_string());
    let mut update = table.update().only_if(format!("id = {}", quote(id)));
    if let Some(cluster_id) = &patch.cluster_id {
      update = update.column("cluster_id", sql_value(cluster_id.as_deref()));
    }
    if let Some(stage) = &patch.lifecycle_stage {
      update = update.column("lifecycle_stage", sql_value(stage.map(|s| s.as_str())));
    }
    update.execute().await.map_err(index_error("failed to patch metadata"))?;
    Ok(())
  }

  async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
    if ids.is_empty() {
      return Ok(());
    }
    let Some(table) = self.table().await? else {
      return Ok(());
    };
    table
      .delete(&format!("id IN ({})", id_list(ids)))
      .await
      .map_err(index_error("failed to delete embeddings"))?;
    Ok(())
  }

  async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<IndexEntry>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let Some(table) = self.table().await? else {
      return Ok(Vec::new());
    };

    let batches: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id IN ({})", id_list(ids)))
      .execute()
      .await
      .map_err(index_error("failed to read embeddings"))?
      .try_collect()
      .await
      .map_err(index_error("failed to read embeddings"))?;

    let mut entries = Vec::new();
    for batch in &batches {
      let embeddings = batch_embeddings(batch)?;
      for ((id, metadata), embedding) in batch_metadata(batch)?.into_iter().zip(embeddings) {
        entries.push(IndexEntry { id, embedding, metadata });
      }
    }
    Ok(entries)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_predicate_combines_clauses() {
    let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let filter = MetadataFilter::orphans().excluding("o'brien").extracted_between(t, t);
    let sql = predicate(&filter).unwrap();
    assert!(sql.starts_with("lifecycle_stage = 'orphan'"));
    assert!(sql.contains("id NOT IN ('o''brien')"));
    assert!(sql.contains(&format!("extracted_at >= {}", t.timestamp_millis())));
  }

  #[test]
  fn test_empty_filter_has_no_predicate() {
    assert!(predicate(&MetadataFilter::default()).is_none());
  }

  #[tokio::test]
  async fn test_round_trip_through_table() {
    let dir = tempfile::TempDir::new().unwrap();
    let index = LanceDbVectorIndex::open(dir.path(), "problems").await.unwrap();
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let meta = IndexMetadata {
      cluster_id: None,
      lifecycle_stage: Some(LifecycleStage::Orphan),
      source_type: "reddit".into(),
      extracted_at: at,
    };

    index.add_embedding("a", &[1.0, 0.0], meta.clone()).await.unwrap();
    index.add_embedding("b", &[0.0, 1.0], meta).await.unwrap();

    let hits = index.query_nearest(&[1.0, 0.0], 5, &MetadataFilter::orphans()).await.unwrap();
    assert_eq!(hits[0].id, "a");

    let patch = MetadataPatch::placement(Some(&crate::models::Placement::active("reddit_01")));
    index.patch_metadata("a", &patch).await.unwrap();
    let entries = index.get_by_ids(&["a".to_string()]).await.unwrap();
    assert_eq!(entries[0].metadata.cluster_id.as_deref(), Some("reddit_01"));

    assert!(matches!(
      index.patch_metadata("missing", &patch).await,
      Err(ClusterError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_configured_backend_is_backfilled_from_store() {
    use crate::config::{ClustersConfig, IndexBackend};
    use crate::index::open_index;
    use crate::models::ProblemRecord;
    use crate::store::{ClusterStore, SqliteClusterStore};

    let dir = tempfile::TempDir::new().unwrap();
    let mut config = ClustersConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.index.backend = IndexBackend::Lancedb;

    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let store = SqliteClusterStore::in_memory().await.unwrap();
    let record = ProblemRecord::new("p1", "reddit", "CSV", vec![1.0, 0.0], at);
    store.ingest_problem(&record).await.unwrap();

    let index = open_index(&config, &store).await.unwrap();

    let entries = index.get_by_ids(&["p1".to_string()]).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(config.index_path().exists());
  }
}
