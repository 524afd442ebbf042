//! SQLite-backed cluster store
//!
//! Timestamps are stored as epoch milliseconds and embeddings as
//! little-endian f32 blobs. Membership is derived from `problems.cluster_id`;
//! the clusters table carries no member list of its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;

use super::{BacklogEntry, ClusterStore, DeferredAssignment, SyncOp};
use crate::models::{
  Cluster, ClusterMetrics, ClusterSnapshot, LifecycleStage, Placement, ProblemRecord,
  SnapshotReason,
};
use crate::{ClusterError, Result};

const SCHEMA: &[&str] = &[
  r#"
  CREATE TABLE IF NOT EXISTS problems (
    id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    post_id TEXT NOT NULL DEFAULT '',
    community TEXT NOT NULL DEFAULT '',
    author TEXT NOT NULL DEFAULT '',
    problem TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT '',
    workaround TEXT NOT NULL DEFAULT '',
    frequency TEXT NOT NULL DEFAULT '',
    embedding BLOB NOT NULL,
    extracted_at INTEGER NOT NULL,
    lifecycle_stage TEXT,
    cluster_id TEXT,
    orphan_since INTEGER
  )
  "#,
  "CREATE INDEX IF NOT EXISTS idx_problems_cluster ON problems(cluster_id)",
  "CREATE INDEX IF NOT EXISTS idx_problems_stage ON problems(lifecycle_stage, orphan_since)",
  r#"
  CREATE TABLE IF NOT EXISTS clusters (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    source_type TEXT NOT NULL,
    similarity_confidence REAL NOT NULL,
    created_at INTEGER NOT NULL,
    last_activity_at INTEGER NOT NULL,
    archived_at INTEGER
  )
  "#,
  r#"
  CREATE TABLE IF NOT EXISTS cluster_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id TEXT NOT NULL,
    snapshot_time INTEGER NOT NULL,
    size INTEGER NOT NULL,
    unique_author_count INTEGER NOT NULL,
    cross_community_count INTEGER NOT NULL,
    avg_frequency_signal REAL NOT NULL,
    reason TEXT NOT NULL
  )
  "#,
  "CREATE INDEX IF NOT EXISTS idx_snapshots_cluster_time ON cluster_snapshots(cluster_id, snapshot_time)",
  r#"
  CREATE TABLE IF NOT EXISTS index_sync_backlog (
    record_id TEXT PRIMARY KEY,
    op TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 1,
    last_error TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL
  )
  "#,
  r#"
  CREATE TABLE IF NOT EXISTS cluster_sequences (
    source_type TEXT PRIMARY KEY,
    last_sequence INTEGER NOT NULL
  )
  "#,
  r#"
  CREATE TABLE IF NOT EXISTS deferred_assignments (
    record_id TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    deferred_at INTEGER NOT NULL
  )
  "#,
];

const PROBLEM_COLUMNS: &str = "id, source_type, post_id, community, author, problem, context, \
  workaround, frequency, embedding, extracted_at, lifecycle_stage, cluster_id, orphan_since";

const CLUSTER_COLUMNS: &str =
  "id, name, description, source_type, similarity_confidence, created_at, last_activity_at, archived_at";

const SNAPSHOT_COLUMNS: &str = "cluster_id, snapshot_time, size, unique_author_count, \
  cross_community_count, avg_frequency_signal, reason";

/// Orphan placement for rows without a usable cluster reference
const ORPHAN_SET: &str = "lifecycle_stage = 'orphan', cluster_id = NULL";

pub struct SqliteClusterStore {
  pool: SqlitePool,
}

impl SqliteClusterStore {
  /// Open (creating if needed) a database file and run migrations
  pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;

    let store = Self { pool };
    store.migrate().await?;
    bentley::verbose!("Opened cluster store at {}", path.display());
    Ok(store)
  }

  /// Private in-memory database, for tests and dry runs
  pub async fn in_memory() -> Result<Self> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    // A single connection that never idles out keeps the in-memory database alive
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;

    let store = Self { pool };
    store.migrate().await?;
    Ok(store)
  }

  async fn migrate(&self) -> Result<()> {
    for statement in SCHEMA {
      sqlx::query(statement).execute(&self.pool).await?;
    }
    Ok(())
  }

  async fn members_by_cluster(&self) -> Result<HashMap<String, BTreeSet<String>>> {
    let rows = sqlx::query(
      "SELECT id, cluster_id FROM problems WHERE lifecycle_stage = 'active' AND cluster_id IS NOT NULL",
    )
    .fetch_all(&self.pool)
    .await?;

    let mut members: HashMap<String, BTreeSet<String>> = HashMap::new();
    for row in rows {
      let id: String = row.try_get("id")?;
      let cluster_id: String = row.try_get("cluster_id")?;
      members.entry(cluster_id).or_default().insert(id);
    }
    Ok(members)
  }

  async fn member_ids(&self, cluster_id: &str) -> Result<BTreeSet<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
      "SELECT id FROM problems WHERE cluster_id = ? AND lifecycle_stage = 'active' ORDER BY id",
    )
    .bind(cluster_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(ids.into_iter().collect())
  }
}

// Row encoding
// ============

fn to_millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(ms)
    .ok_or_else(|| ClusterError::Consistency(format!("timestamp out of range: {ms}")))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
  embedding.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
  if blob.len() % 4 != 0 {
    return Err(ClusterError::Consistency(format!("embedding blob of {} bytes", blob.len())));
  }
  Ok(blob.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

/// Column values for a placement: (stage, cluster_id, orphan_since)
fn encode_placement(
  placement: Option<&Placement>,
) -> (Option<&'static str>, Option<String>, Option<i64>) {
  match placement {
    Some(Placement::Active { cluster_id }) => {
      (Some(LifecycleStage::Active.as_str()), Some(cluster_id.clone()), None)
    }
    Some(Placement::Orphan { since }) => {
      (Some(LifecycleStage::Orphan.as_str()), None, Some(to_millis(*since)))
    }
    None => (None, None, None),
  }
}

/// Rows that do not form a well-formed placement decode as unplaced
fn decode_placement(
  stage: Option<String>,
  cluster_id: Option<String>,
  orphan_since: Option<i64>,
) -> Result<Option<Placement>> {
  let stage = stage.as_deref().and_then(LifecycleStage::parse);
  Ok(match (stage, cluster_id, orphan_since) {
    (Some(LifecycleStage::Active), Some(cluster_id), _) => Some(Placement::Active { cluster_id }),
    (Some(LifecycleStage::Orphan), None, Some(ms)) => Some(Placement::orphan(from_millis(ms)?)),
    _ => None,
  })
}

fn problem_from_row(row: &SqliteRow) -> Result<ProblemRecord> {
  let embedding: Vec<u8> = row.try_get("embedding")?;
  Ok(ProblemRecord {
    id: row.try_get("id")?,
    source_type: row.try_get("source_type")?,
    post_id: row.try_get("post_id")?,
    community: row.try_get("community")?,
    author: row.try_get("author")?,
    problem: row.try_get("problem")?,
    context: row.try_get("context")?,
    workaround: row.try_get("workaround")?,
    frequency: row.try_get("frequency")?,
    embedding: decode_embedding(&embedding)?,
    extracted_at: from_millis(row.try_get("extracted_at")?)?,
    placement: decode_placement(
      row.try_get("lifecycle_stage")?,
      row.try_get("cluster_id")?,
      row.try_get("orphan_since")?,
    )?,
  })
}

fn cluster_from_row(row: &SqliteRow, member_ids: BTreeSet<String>) -> Result<Cluster> {
  let archived_at: Option<i64> = row.try_get("archived_at")?;
  let confidence: f64 = row.try_get("similarity_confidence")?;
  Ok(Cluster {
    id: row.try_get("id")?,
    name: row.try_get("name")?,
    description: row.try_get("description")?,
    source_type: row.try_get("source_type")?,
    member_ids,
    similarity_confidence: confidence as f32,
    created_at: from_millis(row.try_get("created_at")?)?,
    last_activity_at: from_millis(row.try_get("last_activity_at")?)?,
    archived_at: archived_at.map(from_millis).transpose()?,
  })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<ClusterSnapshot> {
  let reason: String = row.try_get("reason")?;
  let size: i64 = row.try_get("size")?;
  let authors: i64 = row.try_get("unique_author_count")?;
  let communities: i64 = row.try_get("cross_community_count")?;
  Ok(ClusterSnapshot {
    cluster_id: row.try_get("cluster_id")?,
    snapshot_time: from_millis(row.try_get("snapshot_time")?)?,
    metrics: ClusterMetrics {
      size: size.max(0) as usize,
      unique_author_count: authors.max(0) as usize,
      cross_community_count: communities.max(0) as usize,
      avg_frequency_signal: row.try_get("avg_frequency_signal")?,
    },
    reason: SnapshotReason::parse(&reason)
      .ok_or_else(|| ClusterError::Consistency(format!("unknown snapshot reason '{reason}'")))?,
  })
}

async fn insert_snapshot_with<'e, E>(executor: E, snapshot: &ClusterSnapshot) -> Result<()>
where
  E: sqlx::Executor<'e, Database = Sqlite>,
{
  sqlx::query(&format!(
    "INSERT INTO cluster_snapshots ({SNAPSHOT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
  ))
  .bind(&snapshot.cluster_id)
  .bind(to_millis(snapshot.snapshot_time))
  .bind(snapshot.metrics.size as i64)
  .bind(snapshot.metrics.unique_author_count as i64)
  .bind(snapshot.metrics.cross_community_count as i64)
  .bind(snapshot.metrics.avg_frequency_signal)
  .bind(snapshot.reason.as_str())
  .execute(executor)
  .await?;
  Ok(())
}

/// Claim one record for a cluster if it is unplaced or an orphan
async fn claim_member<'e, E>(executor: E, cluster_id: &str, record_id: &str) -> Result<bool>
where
  E: sqlx::Executor<'e, Database = Sqlite>,
{
  let result = sqlx::query(
    "UPDATE problems SET lifecycle_stage = 'active', cluster_id = ?, orphan_since = NULL \
     WHERE id = ? AND cluster_id IS NULL",
  )
  .bind(cluster_id)
  .bind(record_id)
  .execute(executor)
  .await?;
  Ok(result.rows_affected() == 1)
}

#[async_trait]
impl ClusterStore for SqliteClusterStore {
  async fn ingest_problem(&self, record: &ProblemRecord) -> Result<ProblemRecord> {
    // Placement is owned by the store; a new row always starts unplaced
    sqlx::query(&format!(
      "INSERT INTO problems ({PROBLEM_COLUMNS}) \
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL) \
       ON CONFLICT(id) DO UPDATE SET \
         source_type = excluded.source_type, post_id = excluded.post_id, \
         community = excluded.community, author = excluded.author, problem = excluded.problem, \
         context = excluded.context, workaround = excluded.workaround, \
         frequency = excluded.frequency, embedding = excluded.embedding, \
         extracted_at = excluded.extracted_at"
    ))
    .bind(&record.id)
    .bind(&record.source_type)
    .bind(&record.post_id)
    .bind(&record.community)
    .bind(&record.author)
    .bind(&record.problem)
    .bind(&record.context)
    .bind(&record.workaround)
    .bind(&record.frequency)
    .bind(encode_embedding(&record.embedding))
    .bind(to_millis(record.extracted_at))
    .execute(&self.pool)
    .await?;

    self
      .get_problem(&record.id)
      .await?
      .ok_or_else(|| ClusterError::NotFound(format!("problem {}", record.id)))
  }

  async fn get_problem(&self, id: &str) -> Result<Option<ProblemRecord>> {
    let row = sqlx::query(&format!("SELECT {PROBLEM_COLUMNS} FROM problems WHERE id = ?"))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(problem_from_row).transpose()
  }

  async fn get_problems(&self, ids: &[String]) -> Result<Vec<ProblemRecord>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let mut query =
      QueryBuilder::<Sqlite>::new(format!("SELECT {PROBLEM_COLUMNS} FROM problems WHERE id IN ("));
    let mut separated = query.separated(", ");
    for id in ids {
      separated.push_bind(id.as_str());
    }
    separated.push_unseparated(") ORDER BY id");

    let rows = query.build().fetch_all(&self.pool).await?;
    rows.iter().map(problem_from_row).collect()
  }

  async fn all_problems(&self) -> Result<Vec<ProblemRecord>> {
    let rows = sqlx::query(&format!("SELECT {PROBLEM_COLUMNS} FROM problems ORDER BY id"))
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(problem_from_row).collect()
  }

  async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<ProblemRecord>> {
    let rows = sqlx::query(&format!(
      "SELECT {PROBLEM_COLUMNS} FROM problems \
       WHERE cluster_id = ? AND lifecycle_stage = 'active' ORDER BY id"
    ))
    .bind(cluster_id)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(problem_from_row).collect()
  }

  async fn set_placement(&self, id: &str, placement: Option<&Placement>) -> Result<()> {
    let (stage, cluster_id, orphan_since) = encode_placement(placement);
    let result = sqlx::query(
      "UPDATE problems SET lifecycle_stage = ?, cluster_id = ?, orphan_since = ? WHERE id = ?",
    )
    .bind(stage)
    .bind(cluster_id)
    .bind(orphan_since)
    .bind(id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(ClusterError::NotFound(format!("problem {id}")));
    }
    Ok(())
  }

  async fn mark_orphans(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      "UPDATE problems SET orphan_since = NULL \
       WHERE lifecycle_stage = 'active' AND cluster_id IS NOT NULL AND orphan_since IS NOT NULL",
    )
    .execute(&mut *tx)
    .await?;

    let ids: Vec<String> = sqlx::query_scalar(&format!(
      "UPDATE problems SET {ORPHAN_SET}, orphan_since = COALESCE(orphan_since, ?) \
       WHERE (cluster_id IS NULL \
              AND (lifecycle_stage IS NULL OR lifecycle_stage != 'orphan' OR orphan_since IS NULL)) \
          OR (cluster_id IS NOT NULL \
              AND (lifecycle_stage IS NULL OR lifecycle_stage != 'active')) \
       RETURNING id"
    ))
    .bind(to_millis(now))
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(ids)
  }

  async fn orphan_dangling_members(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(&format!(
      "UPDATE problems SET {ORPHAN_SET}, orphan_since = ? \
       WHERE cluster_id IS NOT NULL AND cluster_id NOT IN (SELECT id FROM clusters) \
       RETURNING id"
    ))
    .bind(to_millis(now))
    .fetch_all(&self.pool)
    .await?;
    Ok(ids)
  }

  async fn orphans_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProblemRecord>> {
    let rows = sqlx::query(&format!(
      "SELECT {PROBLEM_COLUMNS} FROM problems \
       WHERE lifecycle_stage = 'orphan' AND cluster_id IS NULL \
         AND orphan_since IS NOT NULL AND orphan_since < ? \
       ORDER BY orphan_since, id"
    ))
    .bind(to_millis(cutoff))
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(problem_from_row).collect()
  }

  async fn delete_problems(&self, ids: &[String]) -> Result<u64> {
    let mut tx = self.pool.begin().await?;
    let mut removed = 0;
    for id in ids {
      removed += sqlx::query("DELETE FROM problems WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
      sqlx::query("DELETE FROM deferred_assignments WHERE record_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(removed)
  }

  async fn next_cluster_sequence(&self, source_type: &str) -> Result<u32> {
    // Issued sequences outlive their clusters, so dissolved ids are never handed out again
    let issued: Option<i64> =
      sqlx::query_scalar("SELECT last_sequence FROM cluster_sequences WHERE source_type = ?")
        .bind(source_type)
        .fetch_optional(&self.pool)
        .await?;
    let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM clusters WHERE source_type = ?")
      .bind(source_type)
      .fetch_all(&self.pool)
      .await?;
    let live = ids.iter().filter_map(|id| Cluster::parse_sequence(id)).max().unwrap_or(0);
    let issued = u32::try_from(issued.unwrap_or(0)).unwrap_or(0);
    Ok(live.max(issued) + 1)
  }

  async fn create_cluster(
    &self,
    cluster: &Cluster,
    initial_snapshot: Option<&ClusterSnapshot>,
  ) -> Result<()> {
    let mut tx = self.pool.begin().await?;

    sqlx::query(&format!(
      "INSERT INTO clusters ({CLUSTER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&cluster.id)
    .bind(&cluster.name)
    .bind(&cluster.description)
    .bind(&cluster.source_type)
    .bind(cluster.similarity_confidence as f64)
    .bind(to_millis(cluster.created_at))
    .bind(to_millis(cluster.last_activity_at))
    .bind(cluster.archived_at.map(to_millis))
    .execute(&mut *tx)
    .await?;

    if let Some(sequence) = Cluster::parse_sequence(&cluster.id) {
      sqlx::query(
        "INSERT INTO cluster_sequences (source_type, last_sequence) VALUES (?, ?) \
         ON CONFLICT(source_type) DO UPDATE SET \
           last_sequence = MAX(last_sequence, excluded.last_sequence)",
      )
      .bind(&cluster.source_type)
      .bind(i64::from(sequence))
      .execute(&mut *tx)
      .await?;
    }

    for member in &cluster.member_ids {
      if !claim_member(&mut *tx, &cluster.id, member).await? {
        tx.rollback().await?;
        return Err(ClusterError::Conflict(format!(
          "{member} is no longer claimable for {}",
          cluster.id
        )));
      }
    }

    if let Some(snapshot) = initial_snapshot {
      insert_snapshot_with(&mut *tx, snapshot).await?;
    }

    tx.commit().await?;
    Ok(())
  }

  async fn add_members(&self, cluster_id: &str, ids: &[String], at: DateTime<Utc>) -> Result<()> {
    let mut tx = self.pool.begin().await?;

    let archived: Option<Option<i64>> =
      sqlx::query_scalar("SELECT archived_at FROM clusters WHERE id = ?")
        .bind(cluster_id)
        .fetch_optional(&mut *tx)
        .await?;
    match archived {
      None => {
        tx.rollback().await?;
        return Err(ClusterError::NotFound(format!("cluster {cluster_id}")));
      }
      Some(Some(_)) => {
        tx.rollback().await?;
        return Err(ClusterError::Conflict(format!("cluster {cluster_id} is archived")));
      }
      Some(None) => {}
    }

    for id in ids {
      if !claim_member(&mut *tx, cluster_id, id).await? {
        tx.rollback().await?;
        return Err(ClusterError::Conflict(format!("{id} is no longer claimable for {cluster_id}")));
      }
    }

    sqlx::query("UPDATE clusters SET last_activity_at = MAX(last_activity_at, ?) WHERE id = ?")
      .bind(to_millis(at))
      .bind(cluster_id)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    Ok(())
  }

  async fn get_cluster(&self, id: &str) -> Result<Option<Cluster>> {
    let row = sqlx::query(&format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = ?"))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    match row {
      Some(row) => Ok(Some(cluster_from_row(&row, self.member_ids(id).await?)?)),
      None => Ok(None),
    }
  }

  async fn list_clusters(&self, include_archived: bool) -> Result<Vec<Cluster>> {
    let filter = if include_archived { "" } else { "WHERE archived_at IS NULL" };
    let rows = sqlx::query(&format!("SELECT {CLUSTER_COLUMNS} FROM clusters {filter} ORDER BY id"))
      .fetch_all(&self.pool)
      .await?;

    let mut members = self.members_by_cluster().await?;
    rows
      .iter()
      .map(|row| {
        let id: String = row.try_get("id")?;
        cluster_from_row(row, members.remove(&id).unwrap_or_default())
      })
      .collect()
  }

  async fn update_cluster_summary(&self, id: &str, name: &str, description: &str) -> Result<()> {
    let result = sqlx::query("UPDATE clusters SET name = ?, description = ? WHERE id = ?")
      .bind(name)
      .bind(description)
      .bind(id)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 0 {
      return Err(ClusterError::NotFound(format!("cluster {id}")));
    }
    Ok(())
  }

  async fn inactive_clusters(&self, cutoff: DateTime<Utc>) -> Result<Vec<Cluster>> {
    let rows = sqlx::query(&format!(
      "SELECT {CLUSTER_COLUMNS} FROM clusters \
       WHERE archived_at IS NULL AND last_activity_at < ? ORDER BY id"
    ))
    .bind(to_millis(cutoff))
    .fetch_all(&self.pool)
    .await?;

    let mut members = self.members_by_cluster().await?;
    rows
      .iter()
      .map(|row| {
        let id: String = row.try_get("id")?;
        cluster_from_row(row, members.remove(&id).unwrap_or_default())
      })
      .collect()
  }

  async fn archive_cluster(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
    let result =
      sqlx::query("UPDATE clusters SET archived_at = COALESCE(archived_at, ?) WHERE id = ?")
        .bind(to_millis(at))
        .bind(id)
        .execute(&self.pool)
        .await?;
    if result.rows_affected() == 0 {
      return Err(ClusterError::NotFound(format!("cluster {id}")));
    }
    Ok(())
  }

  async fn undersized_clusters(&self, quorum: usize) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
      "SELECT c.id FROM clusters c \
       LEFT JOIN problems p ON p.cluster_id = c.id AND p.lifecycle_stage = 'active' \
       GROUP BY c.id HAVING COUNT(p.id) < ? ORDER BY c.id",
    )
    .bind(quorum as i64)
    .fetch_all(&self.pool)
    .await?;
    Ok(ids)
  }

  async fn dissolve_cluster(&self, id: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut tx = self.pool.begin().await?;

    let orphaned: Vec<String> = sqlx::query_scalar(&format!(
      "UPDATE problems SET {ORPHAN_SET}, orphan_since = ? WHERE cluster_id = ? RETURNING id"
    ))
    .bind(to_millis(now))
    .bind(id)
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM cluster_snapshots WHERE cluster_id = ?")
      .bind(id)
      .execute(&mut *tx)
      .await?;
    sqlx::query("DELETE FROM clusters WHERE id = ?").bind(id).execute(&mut *tx).await?;

    tx.commit().await?;
    Ok(orphaned)
  }

  async fn insert_snapshot(&self, snapshot: &ClusterSnapshot) -> Result<()> {
    insert_snapshot_with(&self.pool, snapshot).await
  }

  async fn latest_snapshot(&self, cluster_id: &str) -> Result<Option<ClusterSnapshot>> {
    let row = sqlx::query(&format!(
      "SELECT {SNAPSHOT_COLUMNS} FROM cluster_snapshots WHERE cluster_id = ? \
       ORDER BY snapshot_time DESC, id DESC LIMIT 1"
    ))
    .bind(cluster_id)
    .fetch_optional(&self.pool)
    .await?;
    row.as_ref().map(snapshot_from_row).transpose()
  }

  async fn snapshot_history(&self, cluster_id: &str) -> Result<Vec<ClusterSnapshot>> {
    let rows = sqlx::query(&format!(
      "SELECT {SNAPSHOT_COLUMNS} FROM cluster_snapshots WHERE cluster_id = ? \
       ORDER BY snapshot_time, id"
    ))
    .bind(cluster_id)
    .fetch_all(&self.pool)
    .await?;
    rows.iter().map(snapshot_from_row).collect()
  }

  async fn clusters_without_snapshot_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
      "SELECT c.id FROM clusters c WHERE c.archived_at IS NULL AND NOT EXISTS ( \
         SELECT 1 FROM cluster_snapshots s WHERE s.cluster_id = c.id AND s.snapshot_time >= ?) \
       ORDER BY c.id",
    )
    .bind(to_millis(since))
    .fetch_all(&self.pool)
    .await?;
    Ok(ids)
  }

  async fn enqueue_index_sync(
    &self,
    record_id: &str,
    op: SyncOp,
    error: &str,
    at: DateTime<Utc>,
  ) -> Result<()> {
    sqlx::query(
      "INSERT INTO index_sync_backlog (record_id, op, attempts, last_error, enqueued_at) \
       VALUES (?, ?, 1, ?, ?) \
       ON CONFLICT(record_id) DO UPDATE SET \
         op = excluded.op, attempts = attempts + 1, last_error = excluded.last_error",
    )
    .bind(record_id)
    .bind(op.as_str())
    .bind(error)
    .bind(to_millis(at))
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn index_sync_backlog(&self) -> Result<Vec<BacklogEntry>> {
    let rows = sqlx::query(
      "SELECT record_id, op, attempts, last_error, enqueued_at FROM index_sync_backlog \
       ORDER BY enqueued_at, record_id",
    )
    .fetch_all(&self.pool)
    .await?;

    rows
      .iter()
      .map(|row| {
        let op: String = row.try_get("op")?;
        let attempts: i64 = row.try_get("attempts")?;
        Ok(BacklogEntry {
          record_id: row.try_get("record_id")?,
          op: SyncOp::parse(&op)
            .ok_or_else(|| ClusterError::Consistency(format!("unknown backlog op '{op}'")))?,
          attempts: attempts.max(0) as u32,
          last_error: row.try_get("last_error")?,
          enqueued_at: from_millis(row.try_get("enqueued_at")?)?,
        })
      })
      .collect()
  }

  async fn clear_index_sync(&self, record_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM index_sync_backlog WHERE record_id = ?")
      .bind(record_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn defer_assignment(&self, record_id: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
      "INSERT INTO deferred_assignments (record_id, reason, deferred_at) VALUES (?, ?, ?) \
       ON CONFLICT(record_id) DO UPDATE SET reason = excluded.reason, deferred_at = excluded.deferred_at",
    )
    .bind(record_id)
    .bind(reason)
    .bind(to_millis(at))
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn deferred_assignments(&self) -> Result<Vec<DeferredAssignment>> {
    let rows = sqlx::query(
      "SELECT record_id, reason, deferred_at FROM deferred_assignments ORDER BY deferred_at, record_id",
    )
    .fetch_all(&self.pool)
    .await?;
    rows
      .iter()
      .map(|row| {
        Ok(DeferredAssignment {
          record_id: row.try_get("record_id")?,
          reason: row.try_get("reason")?,
          deferred_at: from_millis(row.try_get("deferred_at")?)?,
        })
      })
      .collect()
  }

  async fn clear_deferred(&self, record_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM deferred_assignments WHERE record_id = ?")
      .bind(record_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }
}
