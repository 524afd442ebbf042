//! Keeps the vector index in step with the cluster store
//!
//! The store is written first and is authoritative. Index writes are retried
//! under the index timeout; a write that still fails is queued in the store's
//! index-sync backlog and replayed at the start of the next pass.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::index::{IndexMetadata, MetadataPatch, VectorIndex};
use crate::journal::RunJournal;
use crate::models::ProblemRecord;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{ClusterStore, SyncOp};
use crate::{ClusterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
  Synced,
  /// The index write failed and was added to the backlog
  Queued,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  pub replayed: usize,
  pub still_pending: usize,
}

#[derive(Clone)]
pub struct IndexMirror {
  index: Arc<dyn VectorIndex>,
  store: Arc<dyn ClusterStore>,
  retry: RetryPolicy,
  journal: RunJournal,
}

impl IndexMirror {
  pub fn new(
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn ClusterStore>,
    retry: RetryPolicy,
    journal: RunJournal,
  ) -> Self {
    Self { index, store, retry, journal }
  }

  pub fn index(&self) -> &Arc<dyn VectorIndex> {
    &self.index
  }

  /// Mirror a record's stored placement into the index
  pub async fn mirror(&self, record: &ProblemRecord) -> Result<MirrorOutcome> {
    match self.write_record(record).await {
      Ok(()) => Ok(MirrorOutcome::Synced),
      Err(e) if e.is_fatal() => Err(e),
      Err(e) => {
        self.queue(&record.id, SyncOp::Upsert, &e).await?;
        Ok(MirrorOutcome::Queued)
      }
    }
  }

  /// Mirror several records; returns how many had to be queued
  pub async fn mirror_all(&self, records: &[ProblemRecord]) -> Result<usize> {
    let mut queued = 0;
    for record in records {
      if self.mirror(record).await? == MirrorOutcome::Queued {
        queued += 1;
      }
    }
    Ok(queued)
  }

  /// Delete records from the index. Ids that could not be removed are queued
  /// and returned.
  pub async fn remove(&self, ids: &[String]) -> Result<Vec<String>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    match self.delete_ids(ids).await {
      Ok(()) => Ok(Vec::new()),
      Err(e) if e.is_fatal() => Err(e),
      Err(e) => {
        for id in ids {
          self.queue(id, SyncOp::Delete, &e).await?;
        }
        Ok(ids.to_vec())
      }
    }
  }

  /// Retry every backlog entry once
  pub async fn replay_backlog(&self) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();
    for entry in self.store.index_sync_backlog().await? {
      let outcome = match entry.op {
        SyncOp::Upsert => match self.store.get_problem(&entry.record_id).await? {
          Some(record) => self.write_record(&record).await,
          // Gone from the store, so it must go from the index too
          None => self.delete_ids(std::slice::from_ref(&entry.record_id)).await,
        },
        SyncOp::Delete => self.delete_ids(std::slice::from_ref(&entry.record_id)).await,
      };

      match outcome {
        Ok(()) => {
          self.store.clear_index_sync(&entry.record_id).await?;
          report.replayed += 1;
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
          self.store.enqueue_index_sync(&entry.record_id, entry.op, &e.to_string(), Utc::now()).await?;
          report.still_pending += 1;
        }
      }
    }
    if report.replayed > 0 || report.still_pending > 0 {
      bentley::info!(
        "Index backlog: {} replayed, {} still pending",
        report.replayed,
        report.still_pending
      );
    }
    Ok(report)
  }

  /// Patch in place, falling back to a full upsert when the index lacks the entry
  async fn write_record(&self, record: &ProblemRecord) -> Result<()> {
    let patch = MetadataPatch::placement(record.placement.as_ref());
    let patched = with_retry(&self.retry, self.retry.index_timeout(), "index patch", || {
      self.index.patch_metadata(&record.id, &patch)
    })
    .await;

    match patched {
      Err(ClusterError::NotFound(_)) => {
        let metadata = IndexMetadata::from_record(record);
        with_retry(&self.retry, self.retry.index_timeout(), "index upsert", || {
          self.index.add_embedding(&record.id, &record.embedding, metadata.clone())
        })
        .await
      }
      other => other,
    }
  }

  async fn delete_ids(&self, ids: &[String]) -> Result<()> {
    with_retry(&self.retry, self.retry.index_timeout(), "index delete", || {
      self.index.delete_by_ids(ids)
    })
    .await
  }

  async fn queue(&self, record_id: &str, op: SyncOp, error: &ClusterError) -> Result<()> {
    self.store.enqueue_index_sync(record_id, op, &error.to_string(), Utc::now()).await?;
    self
      .journal
      .warn("index-sync", format!("index {} deferred to backlog: {error}", op.as_str()), Some(record_id))
      .await;
    Ok(())
  }
}
