//! Cluster store abstraction
//!
//! The relational source of truth for problem records, clusters and
//! snapshots. Every placement write sets cluster id, stage and orphan
//! timestamp in one statement, and multi-record membership changes run in a
//! single transaction.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Cluster, ClusterSnapshot, Placement, ProblemRecord};
use crate::Result;

pub use sqlite::SqliteClusterStore;

/// Index operation waiting to be replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
  /// Re-mirror the record's current embedding and placement
  Upsert,
  /// Remove the record from the index
  Delete,
}

impl SyncOp {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncOp::Upsert => "upsert",
      SyncOp::Delete => "delete",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "upsert" => Some(SyncOp::Upsert),
      "delete" => Some(SyncOp::Delete),
      _ => None,
    }
  }
}

/// A record whose index mirror write failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogEntry {
  pub record_id: String,
  pub op: SyncOp,
  pub attempts: u32,
  pub last_error: String,
  pub enqueued_at: DateTime<Utc>,
}

/// A record whose assignment was deferred to the next pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredAssignment {
  pub record_id: String,
  pub reason: String,
  pub deferred_at: DateTime<Utc>,
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
  // Problem records
  // ===============

  /// Insert a record if absent, otherwise refresh its content fields.
  /// Placement of an existing row is never changed. Returns the stored row.
  async fn ingest_problem(&self, record: &ProblemRecord) -> Result<ProblemRecord>;

  async fn get_problem(&self, id: &str) -> Result<Option<ProblemRecord>>;

  /// Stored rows for `ids`; unknown ids are skipped
  async fn get_problems(&self, ids: &[String]) -> Result<Vec<ProblemRecord>>;

  async fn all_problems(&self) -> Result<Vec<ProblemRecord>>;

  async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<ProblemRecord>>;

  /// Overwrite a record's placement in one statement; `NotFound` for unknown ids
  async fn set_placement(&self, id: &str, placement: Option<&Placement>) -> Result<()>;

  /// Orphan every row without a cluster id that is not already a well-formed
  /// orphan. Returns the ids that changed.
  async fn mark_orphans(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

  /// Orphan active rows whose cluster no longer exists. Returns the ids that changed.
  async fn orphan_dangling_members(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

  /// Orphans whose `orphan_since` is strictly before `cutoff`
  async fn orphans_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProblemRecord>>;

  /// Hard-delete records. Returns the number of rows removed.
  async fn delete_problems(&self, ids: &[String]) -> Result<u64>;

  // Clusters
  // ========

  /// Next free sequence number for cluster ids in a source partition
  async fn next_cluster_sequence(&self, source_type: &str) -> Result<u32>;

  /// Create a cluster and claim its members in one transaction.
  ///
  /// A member is claimable when it is unplaced or an orphan. If any member
  /// cannot be claimed the transaction rolls back with `ClusterError::Conflict`.
  async fn create_cluster(
    &self,
    cluster: &Cluster,
    initial_snapshot: Option<&ClusterSnapshot>,
  ) -> Result<()>;

  /// Claim records into an existing, non-archived cluster and bump its activity time
  async fn add_members(&self, cluster_id: &str, ids: &[String], at: DateTime<Utc>) -> Result<()>;

  async fn get_cluster(&self, id: &str) -> Result<Option<Cluster>>;

  async fn list_clusters(&self, include_archived: bool) -> Result<Vec<Cluster>>;

  async fn update_cluster_summary(&self, id: &str, name: &str, description: &str) -> Result<()>;

  /// Non-archived clusters whose `last_activity_at` is strictly before `cutoff`
  async fn inactive_clusters(&self, cutoff: DateTime<Utc>) -> Result<Vec<Cluster>>;

  async fn archive_cluster(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

  /// Ids of clusters with fewer than `quorum` members
  async fn undersized_clusters(&self, quorum: usize) -> Result<Vec<String>>;

  /// Orphan the members, drop the snapshots and remove the cluster row.
  /// Returns the orphaned member ids.
  async fn dissolve_cluster(&self, id: &str, now: DateTime<Utc>) -> Result<Vec<String>>;

  // Snapshots
  // =========

  async fn insert_snapshot(&self, snapshot: &ClusterSnapshot) -> Result<()>;

  async fn latest_snapshot(&self, cluster_id: &str) -> Result<Option<ClusterSnapshot>>;

  /// Oldest first
  async fn snapshot_history(&self, cluster_id: &str) -> Result<Vec<ClusterSnapshot>>;

  /// Non-archived clusters with no snapshot at or after `since`
  async fn clusters_without_snapshot_since(&self, since: DateTime<Utc>) -> Result<Vec<String>>;

  // Index-sync backlog
  // ==================

  /// Record (or bump) a pending index operation for a record
  async fn enqueue_index_sync(
    &self,
    record_id: &str,
    op: SyncOp,
    error: &str,
    at: DateTime<Utc>,
  ) -> Result<()>;

  async fn index_sync_backlog(&self) -> Result<Vec<BacklogEntry>>;

  async fn clear_index_sync(&self, record_id: &str) -> Result<()>;

  // Deferred assignments
  // ====================

  async fn defer_assignment(&self, record_id: &str, reason: &str, at: DateTime<Utc>) -> Result<()>;

  async fn deferred_assignments(&self) -> Result<Vec<DeferredAssignment>>;

  async fn clear_deferred(&self, record_id: &str) -> Result<()>;
}
