mod fakes;

use bentley::journal::JournalQuery;
use chrono::Duration;

use clusters::store::{ClusterStore, SyncOp};
use clusters::{LifecycleStage, Placement, ProblemRecord};
use fakes::{invoice_record, now, unrelated_record, Harness, JudgeMode};

/// Store and index an orphan that has been waiting `age`
async fn plant_orphan(h: &Harness, id: &str, age: Duration) {
  let record = unrelated_record(id, age + Duration::hours(1));
  h.store.ingest_problem(&record).await.unwrap();
  let placement = Placement::orphan(now() - age);
  h.store.set_placement(id, Some(&placement)).await.unwrap();
  h.mirror().mirror(&record.with_placement(placement)).await.unwrap();
}

/// Batch-build one cluster of four similar records
async fn build_cluster_of_four(h: &Harness) -> Vec<ProblemRecord> {
  let records: Vec<ProblemRecord> =
    (1..=4).map(|i| invoice_record(&format!("b{i}"), i, Duration::hours(i as i64))).collect();
  let report = h.pipeline.build(&records, now()).await.unwrap();
  assert_eq!(report.clusters_created, vec!["reddit_01".to_string()]);
  records
}

#[tokio::test]
async fn test_orphan_retention_window() {
  let h = Harness::new(JudgeMode::Accept(0.8)).await;
  plant_orphan(&h, "fresh", Duration::days(13)).await;
  plant_orphan(&h, "stale", Duration::days(15)).await;

  let report = h.pipeline.cleanup(now()).await.unwrap();

  assert_eq!(report.expired_orphans, 1);
  assert!(report.deletion_failures.is_empty());
  assert!(h.store.get_problem("stale").await.unwrap().is_none());
  assert!(h.index.metadata("stale").await.is_none());
  assert!(h.store.get_problem("fresh").await.unwrap().is_some());
  assert!(h.index.metadata("fresh").await.is_some());
}

#[tokio::test]
async fn test_failed_index_delete_is_queued_and_replayed() {
  let h = Harness::new(JudgeMode::Accept(0.8)).await;
  plant_orphan(&h, "stale", Duration::days(20)).await;
  h.index.set_failing(true);

  let report = h.pipeline.cleanup(now()).await.unwrap();

  assert_eq!(report.deletion_failures, vec!["stale".to_string()]);
  assert!(h.store.get_problem("stale").await.unwrap().is_none());
  let backlog = h.store.index_sync_backlog().await.unwrap();
  assert_eq!(backlog.len(), 1);
  assert_eq!(backlog[0].op, SyncOp::Delete);
  assert!(h.index.metadata("stale").await.is_some());

  h.index.set_failing(false);
  h.pipeline.cleanup(now()).await.unwrap();

  assert!(h.index.metadata("stale").await.is_none());
  assert!(h.store.index_sync_backlog().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unplaced_records_are_marked_orphan_once() {
  let h = Harness::new(JudgeMode::Accept(0.8)).await;
  h.store.ingest_problem(&unrelated_record("x1", Duration::hours(1))).await.unwrap();

  let first = h.pipeline.cleanup(now()).await.unwrap();
  let second = h.pipeline.cleanup(now() + Duration::days(1)).await.unwrap();

  assert_eq!(first.marked_orphans, 1);
  assert_eq!(second.marked_orphans, 0);
  let stored = h.store.get_problem("x1").await.unwrap().unwrap();
  assert_eq!(stored.orphan_since(), Some(now()));
  h.assert_index_matches_store().await;
}

#[tokio::test]
async fn test_cluster_below_quorum_is_dissolved() {
  let h = Harness::new(JudgeMode::Accept(0.8)).await;
  build_cluster_of_four(&h).await;
  h.store.delete_problems(&["b1".to_string()]).await.unwrap();

  let report = h.pipeline.cleanup(now()).await.unwrap();

  assert_eq!(report.dissolved_clusters, vec!["reddit_01".to_string()]);
  assert!(h.store.get_cluster("reddit_01").await.unwrap().is_none());
  assert!(h.store.snapshot_history("reddit_01").await.unwrap().is_empty());
  assert_eq!(h.store.next_cluster_sequence("reddit").await.unwrap(), 2);
  let repairs = JournalQuery { stage: Some("repair".to_string()), ..JournalQuery::default() };
  let entries = h.journal.read(&repairs).await.unwrap();
  assert!(entries.iter().any(|e| e.cluster_id.as_deref() == Some("reddit_01")));
  for id in ["b2", "b3", "b4"] {
    let member = h.store.get_problem(id).await.unwrap().unwrap();
    assert_eq!(member.lifecycle_stage(), Some(LifecycleStage::Orphan));
    assert_eq!(member.orphan_since(), Some(now()));
  }
  h.assert_clusters_meet_quorum().await;
  h.assert_placement_invariant().await;
  h.assert_index_matches_store().await;
}

#[tokio::test]
async fn test_dangling_cluster_reference_is_repaired() {
  let h = Harness::new(JudgeMode::Accept(0.8)).await;
  let record = unrelated_record("x1", Duration::hours(1));
  h.store.ingest_problem(&record).await.unwrap();
  h.store.set_placement("x1", Some(&Placement::active("ghost_01"))).await.unwrap();

  let report = h.pipeline.cleanup(now()).await.unwrap();

  assert_eq!(report.repaired_dangling, 1);
  let stored = h.store.get_problem("x1").await.unwrap().unwrap();
  assert!(stored.is_orphan());
  h.assert_index_matches_store().await;
}

#[tokio::test]
async fn test_inactive_cluster_is_archived_and_excluded() {
  let h = Harness::new(JudgeMode::Accept(0.8)).await;
  build_cluster_of_four(&h).await;
  let later = now() + Duration::days(91);

  let report = h.pipeline.cleanup(later).await.unwrap();

  assert_eq!(report.archived_clusters, vec!["reddit_01".to_string()]);
  let archived = JournalQuery { stage: Some("archive".to_string()), ..JournalQuery::default() };
  let entries = h.journal.read(&archived).await.unwrap();
  assert_eq!(entries.len(), 1);
  assert_eq!(entries[0].cluster_id.as_deref(), Some("reddit_01"));
  let cluster = h.store.get_cluster("reddit_01").await.unwrap().unwrap();
  assert_eq!(cluster.archived_at, Some(later));
  assert!(h.store.list_clusters(false).await.unwrap().is_empty());

  // A matching record no longer merges into the archived cluster
  let assigned =
    h.pipeline.assign(&[invoice_record("n1", 2, Duration::days(-91))], later).await.unwrap();
  assert_eq!(assigned.merged, 0);
  assert_eq!(assigned.orphaned, 1);
}

#[tokio::test]
async fn test_cluster_inside_archive_window_stays_live() {
  let h = Harness::new(JudgeMode::Accept(0.8)).await;
  build_cluster_of_four(&h).await;

  let report = h.pipeline.cleanup(now() + Duration::days(89)).await.unwrap();

  assert!(report.archived_clusters.is_empty());
}
