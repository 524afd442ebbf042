//! Problem records and their placement in the cluster lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage a placed record is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
  Active,
  Orphan,
}

impl LifecycleStage {
  pub fn as_str(&self) -> &'static str {
    match self {
      LifecycleStage::Active => "active",
      LifecycleStage::Orphan => "orphan",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "active" => Some(LifecycleStage::Active),
      "orphan" => Some(LifecycleStage::Orphan),
      _ => None,
    }
  }
}

/// Where a record currently lives.
///
/// Carrying the cluster id on `Active` and the timestamp on `Orphan` keeps
/// `active <=> cluster_id present <=> orphan_since absent` true by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum Placement {
  Active { cluster_id: String },
  Orphan { since: DateTime<Utc> },
}

impl Placement {
  pub fn active(cluster_id: &str) -> Self {
    Placement::Active { cluster_id: cluster_id.to_string() }
  }

  pub fn orphan(since: DateTime<Utc>) -> Self {
    Placement::Orphan { since }
  }

  pub fn stage(&self) -> LifecycleStage {
    match self {
      Placement::Active { .. } => LifecycleStage::Active,
      Placement::Orphan { .. } => LifecycleStage::Orphan,
    }
  }

  pub fn cluster_id(&self) -> Option<&str> {
    match self {
      Placement::Active { cluster_id } => Some(cluster_id),
      Placement::Orphan { .. } => None,
    }
  }

  pub fn orphan_since(&self) -> Option<DateTime<Utc>> {
    match self {
      Placement::Active { .. } => None,
      Placement::Orphan { since } => Some(*since),
    }
  }
}

/// One extracted pain statement with its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
  pub id: String,
  /// Partition key (the platform or feed the post came from)
  pub source_type: String,
  #[serde(default)]
  pub post_id: String,
  #[serde(default)]
  pub community: String,
  #[serde(default)]
  pub author: String,
  pub problem: String,
  #[serde(default)]
  pub context: String,
  #[serde(default)]
  pub workaround: String,
  /// Free-text frequency phrase from extraction ("every day", "monthly", ...)
  #[serde(default)]
  pub frequency: String,
  pub embedding: Vec<f32>,
  pub extracted_at: DateTime<Utc>,
  /// `None` until the record has been routed through the pipeline
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub placement: Option<Placement>,
}

impl ProblemRecord {
  pub fn new(
    id: &str,
    source_type: &str,
    problem: &str,
    embedding: Vec<f32>,
    extracted_at: DateTime<Utc>,
  ) -> Self {
    Self {
      id: id.to_string(),
      source_type: source_type.to_string(),
      post_id: String::new(),
      community: String::new(),
      author: String::new(),
      problem: problem.to_string(),
      context: String::new(),
      workaround: String::new(),
      frequency: String::new(),
      embedding,
      extracted_at,
      placement: None,
    }
  }

  pub fn with_author(mut self, author: &str) -> Self {
    self.author = author.to_string();
    self
  }

  pub fn with_community(mut self, community: &str) -> Self {
    self.community = community.to_string();
    self
  }

  pub fn with_post(mut self, post_id: &str) -> Self {
    self.post_id = post_id.to_string();
    self
  }

  pub fn with_frequency(mut self, frequency: &str) -> Self {
    self.frequency = frequency.to_string();
    self
  }

  pub fn with_details(mut self, context: &str, workaround: &str) -> Self {
    self.context = context.to_string();
    self.workaround = workaround.to_string();
    self
  }

  pub fn with_placement(mut self, placement: Placement) -> Self {
    self.placement = Some(placement);
    self
  }

  pub fn lifecycle_stage(&self) -> Option<LifecycleStage> {
    self.placement.as_ref().map(Placement::stage)
  }

  pub fn cluster_id(&self) -> Option<&str> {
    self.placement.as_ref().and_then(Placement::cluster_id)
  }

  pub fn orphan_since(&self) -> Option<DateTime<Utc>> {
    self.placement.as_ref().and_then(Placement::orphan_since)
  }

  pub fn is_orphan(&self) -> bool {
    self.lifecycle_stage() == Some(LifecycleStage::Orphan)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
  }

  #[test]
  fn test_placement_accessors_agree() {
    let active = Placement::active("reddit_01");
    assert_eq!(active.stage(), LifecycleStage::Active);
    assert_eq!(active.cluster_id(), Some("reddit_01"));
    assert_eq!(active.orphan_since(), None);

    let orphan = Placement::orphan(at());
    assert_eq!(orphan.stage(), LifecycleStage::Orphan);
    assert_eq!(orphan.cluster_id(), None);
    assert_eq!(orphan.orphan_since(), Some(at()));
  }

  #[test]
  fn test_unplaced_record_has_no_stage() {
    let record = ProblemRecord::new("p-1", "reddit", "Exports break", vec![1.0, 0.0], at());
    assert_eq!(record.lifecycle_stage(), None);
    assert_eq!(record.cluster_id(), None);
    assert!(!record.is_orphan());
  }

  #[test]
  fn test_record_deserializes_without_optional_fields() {
    let json = r#"{
      "id": "p-9",
      "source_type": "hn",
      "problem": "Invoices need manual reconciliation",
      "embedding": [0.1, 0.2],
      "extracted_at": "2026-03-01T12:00:00Z"
    }"#;
    let record: ProblemRecord = serde_json::from_str(json).unwrap();
    assert_eq!(record.author, "");
    assert!(record.placement.is_none());
  }

  #[test]
  fn test_placement_serializes_tagged() {
    let json = serde_json::to_value(Placement::active("hn_02")).unwrap();
    assert_eq!(json["stage"], "active");
    assert_eq!(json["cluster_id"], "hn_02");
  }
}
