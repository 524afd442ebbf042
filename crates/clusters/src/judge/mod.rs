//! Semantic judge interface
//!
//! The judge is an LLM-backed service that decides whether a candidate group
//! of problem statements describes one recurring workflow, and names it.
//! Unusable replies (non-2xx, malformed JSON) come back as values and turn
//! into rejections; only transport faults surface as errors.

pub mod http;
pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::ProblemRecord;
use crate::retry::{with_retry, RetryPolicy};
use crate::Result;

pub use http::HttpSemanticJudge;

/// The extraction fields the judge reasons over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeItem {
  pub problem: String,
  pub context: String,
  pub workaround: String,
}

impl From<&ProblemRecord> for JudgeItem {
  fn from(record: &ProblemRecord) -> Self {
    Self {
      problem: record.problem.clone(),
      context: record.context.clone(),
      workaround: record.workaround.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRequest {
  pub items: Vec<JudgeItem>,
  pub source_type: Option<String>,
}

impl JudgeRequest {
  pub fn from_records<'a, I>(records: I, source_type: Option<&str>) -> Self
  where
    I: IntoIterator<Item = &'a ProblemRecord>,
  {
    Self {
      items: records.into_iter().map(JudgeItem::from).collect(),
      source_type: source_type.map(str::to_string),
    }
  }
}

/// Decoded judge reply. Every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeResponse {
  #[serde(alias = "isValidCluster", alias = "is_valid")]
  pub is_valid_cluster: bool,
  #[serde(alias = "similarityScore")]
  pub similarity_score: f32,
  pub name: String,
  pub description: String,
  pub confidence: f32,
  pub reasoning: String,
}

impl JudgeResponse {
  /// Scores clamped into [0, 1]; NaN counts as 0
  pub fn normalized(mut self) -> Self {
    self.similarity_score = clamp_unit(self.similarity_score);
    self.confidence = clamp_unit(self.confidence);
    self
  }
}

fn clamp_unit(value: f32) -> f32 {
  if value.is_nan() {
    0.0
  } else {
    value.clamp(0.0, 1.0)
  }
}

/// What came back from one judge call
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
  Response(JudgeResponse),
  /// The service answered but the reply could not be used
  Unusable(String),
}

/// Name and description for a cluster
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSummary {
  pub name: String,
  pub description: String,
}

impl ClusterSummary {
  pub fn is_usable(&self) -> bool {
    !self.name.trim().is_empty() && !self.description.trim().is_empty()
  }
}

/// An accepted group's judge-assigned identity
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterProposal {
  pub name: String,
  pub description: String,
  pub similarity_score: f32,
  pub confidence: f32,
  pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
  Accepted(ClusterProposal),
  Rejected { reason: String },
}

impl Verdict {
  pub fn is_accepted(&self) -> bool {
    matches!(self, Verdict::Accepted(_))
  }

  /// Acceptance requires a valid-cluster flag and a score at or above the threshold
  pub fn from_assessment(assessment: Assessment, threshold: f32) -> Self {
    match assessment {
      Assessment::Unusable(reason) => Verdict::Rejected { reason },
      Assessment::Response(response) => {
        let response = response.normalized();
        if !response.is_valid_cluster {
          Verdict::Rejected { reason: format!("not a single workflow: {}", response.reasoning) }
        } else if response.similarity_score < threshold {
          Verdict::Rejected {
            reason: format!(
              "similarity {:.2} below threshold {threshold:.2}",
              response.similarity_score
            ),
          }
        } else {
          Verdict::Accepted(ClusterProposal {
            name: response.name,
            description: response.description,
            similarity_score: response.similarity_score,
            confidence: response.confidence,
            reasoning: response.reasoning,
          })
        }
      }
    }
  }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SemanticJudge: Send + Sync {
  /// Ask whether the group is one coherent workflow
  async fn assess_group(&self, request: &JudgeRequest) -> Result<Assessment>;

  /// Regenerate a cluster's name and description; `None` when the reply is unusable
  async fn summarize_cluster(&self, request: &JudgeRequest) -> Result<Option<ClusterSummary>>;
}

/// Run a group through the judge with retries and apply the acceptance rule.
///
/// Errors are transport faults that outlived the retry budget.
pub async fn validate_group(
  judge: &dyn SemanticJudge,
  request: &JudgeRequest,
  threshold: f32,
  retry: &RetryPolicy,
) -> Result<Verdict> {
  let assessment =
    with_retry(retry, retry.judge_timeout(), "judge assessment", || judge.assess_group(request))
      .await?;
  Ok(Verdict::from_assessment(assessment, threshold))
}

/// Regenerate a summary with retries; `None` when the judge had nothing usable
pub async fn summarize(
  judge: &dyn SemanticJudge,
  request: &JudgeRequest,
  retry: &RetryPolicy,
) -> Result<Option<ClusterSummary>> {
  let summary =
    with_retry(retry, retry.judge_timeout(), "judge summary", || judge.summarize_cluster(request))
      .await?;
  Ok(summary.filter(ClusterSummary::is_usable))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ClusterError;

  fn response(valid: bool, score: f32) -> JudgeResponse {
    JudgeResponse {
      is_valid_cluster: valid,
      similarity_score: score,
      name: "Manual invoice reconciliation".to_string(),
      description: "Finance teams reconcile invoices by hand".to_string(),
      confidence: 0.9,
      reasoning: "same workflow".to_string(),
    }
  }

  fn request() -> JudgeRequest {
    JudgeRequest {
      items: vec![JudgeItem {
        problem: "p".to_string(),
        context: String::new(),
        workaround: String::new(),
      }],
      source_type: Some("reddit".to_string()),
    }
  }

  #[test]
  fn test_acceptance_rule() {
    assert!(Verdict::from_assessment(Assessment::Response(response(true, 0.8)), 0.7).is_accepted());
    assert!(Verdict::from_assessment(Assessment::Response(response(true, 0.7)), 0.7).is_accepted());
    assert!(!Verdict::from_assessment(Assessment::Response(response(true, 0.69)), 0.7).is_accepted());
    assert!(!Verdict::from_assessment(Assessment::Response(response(false, 0.95)), 0.7).is_accepted());
    assert!(!Verdict::from_assessment(Assessment::Unusable("502".into()), 0.7).is_accepted());
  }

  #[test]
  fn test_lenient_decode() {
    let decoded: JudgeResponse =
      serde_json::from_str(r#"{"isValidCluster": true, "similarityScore": 1.7}"#).unwrap();
    let decoded = decoded.normalized();
    assert!(decoded.is_valid_cluster);
    assert_eq!(decoded.similarity_score, 1.0);
    assert_eq!(decoded.name, "");
  }

  #[tokio::test]
  async fn test_validate_group_uses_judge() {
    let mut judge = MockSemanticJudge::new();
    judge.expect_assess_group().times(1).returning(|_| Ok(Assessment::Response(response(true, 0.8))));

    let verdict = validate_group(&judge, &request(), 0.7, &RetryPolicy::immediate()).await.unwrap();
    match verdict {
      Verdict::Accepted(proposal) => assert_eq!(proposal.name, "Manual invoice reconciliation"),
      other => panic!("expected acceptance, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_validate_group_surfaces_transport_failure() {
    let mut judge = MockSemanticJudge::new();
    judge.expect_assess_group().returning(|_| Err(ClusterError::Transport("refused".into())));

    let result = validate_group(&judge, &request(), 0.7, &RetryPolicy::immediate()).await;
    assert!(matches!(result, Err(ClusterError::Transport(_))));
  }

  #[tokio::test]
  async fn test_blank_summary_discarded() {
    let mut judge = MockSemanticJudge::new();
    judge
      .expect_summarize_cluster()
      .returning(|_| Ok(Some(ClusterSummary { name: " ".into(), description: "x".into() })));

    let summary = summarize(&judge, &request(), &RetryPolicy::immediate()).await.unwrap();
    assert!(summary.is_none());
  }
}
