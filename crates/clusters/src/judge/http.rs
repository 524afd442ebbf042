//! OpenAI-compatible chat completions judge

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::prompt;
use super::{Assessment, ClusterSummary, JudgeRequest, JudgeResponse, SemanticJudge};
use crate::config::JudgeConfig;
use crate::{ClusterError, Result};

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
  role: &'a str,
  content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
  model: &'a str,
  messages: Vec<ChatMessage<'a>>,
  temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
  #[serde(default)]
  choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
  message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
  #[serde(default)]
  content: Option<String>,
}

/// Reply text, or the reason there is none
enum Completion {
  Text(String),
  Unusable(String),
}

pub struct HttpSemanticJudge {
  client: Client,
  endpoint: String,
  model: String,
  api_key: Option<String>,
}

impl HttpSemanticJudge {
  pub fn new(config: &JudgeConfig, timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| ClusterError::Config(format!("failed to build judge HTTP client: {e}")))?;

    Ok(Self {
      client,
      endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
      model: config.model.clone(),
      api_key: config.api_key.clone(),
    })
  }

  async fn complete(&self, system: &str, user: &str) -> Result<Completion> {
    let body = ChatRequest {
      model: &self.model,
      messages: vec![
        ChatMessage { role: "system", content: system },
        ChatMessage { role: "user", content: user },
      ],
      temperature: 0.0,
    };

    let mut request = self.client.post(&self.endpoint).json(&body);
    if let Some(key) = &self.api_key {
      request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if !status.is_success() {
      let detail = response.text().await.unwrap_or_default();
      return Ok(Completion::Unusable(format!("judge returned {status}: {}", truncate(&detail, 200))));
    }

    let text = response.text().await.map_err(transport_error)?;
    let parsed: ChatResponse = match serde_json::from_str(&text) {
      Ok(parsed) => parsed,
      Err(e) => return Ok(Completion::Unusable(format!("undecodable completion: {e}"))),
    };

    match parsed.choices.into_iter().next().and_then(|choice| choice.message.content) {
      Some(content) if !content.trim().is_empty() => Ok(Completion::Text(content)),
      _ => Ok(Completion::Unusable("completion had no content".to_string())),
    }
  }
}

#[async_trait]
impl SemanticJudge for HttpSemanticJudge {
  async fn assess_group(&self, request: &JudgeRequest) -> Result<Assessment> {
    let text = match self.complete(prompt::ASSESS_SYSTEM, &prompt::assess_user(request)).await? {
      Completion::Text(text) => text,
      Completion::Unusable(reason) => return Ok(Assessment::Unusable(reason)),
    };

    match decode_object::<JudgeResponse>(&text) {
      Some(response) => Ok(Assessment::Response(response.normalized())),
      None => Ok(Assessment::Unusable(format!("no JSON verdict in reply: {}", truncate(&text, 120)))),
    }
  }

  async fn summarize_cluster(&self, request: &JudgeRequest) -> Result<Option<ClusterSummary>> {
    match self.complete(prompt::SUMMARIZE_SYSTEM, &prompt::summarize_user(request)).await? {
      Completion::Text(text) => Ok(decode_object::<ClusterSummary>(&text)),
      Completion::Unusable(reason) => {
        bentley::verbose!("Summary reply unusable: {reason}");
        Ok(None)
      }
    }
  }
}

fn transport_error(e: reqwest::Error) -> ClusterError {
  if e.is_timeout() {
    ClusterError::Timeout { operation: "judge request".to_string(), elapsed_ms: 0 }
  } else {
    ClusterError::Transport(e.to_string())
  }
}

/// Decode the outermost `{...}` span of a reply, tolerating prose or code fences around it
pub(crate) fn decode_object<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
  let start = text.find('{')?;
  let end = text.rfind('}')?;
  if end < start {
    return None;
  }
  serde_json::from_str(&text[start..=end]).ok()
}

fn truncate(text: &str, max_chars: usize) -> String {
  if text.chars().count() <= max_chars {
    text.to_string()
  } else {
    format!("{}...", text.chars().take(max_chars).collect::<String>())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::judge::JudgeItem;
  use mockito::Server;

  fn judge_for(server: &Server) -> HttpSemanticJudge {
    let config = JudgeConfig {
      base_url: server.url(),
      model: "test-model".to_string(),
      api_key: Some("sk-test".to_string()),
    };
    HttpSemanticJudge::new(&config, Duration::from_secs(5)).unwrap()
  }

  fn request() -> JudgeRequest {
    JudgeRequest {
      items: vec![JudgeItem {
        problem: "Invoices reconciled by hand".into(),
        context: "".into(),
        workaround: "Spreadsheet".into(),
      }],
      source_type: Some("reddit".into()),
    }
  }

  fn completion(content: &str) -> String {
    serde_json::json!({ "choices": [ { "message": { "role": "assistant", "content": content } } ] })
      .to_string()
  }

  #[tokio::test]
  async fn test_assess_decodes_fenced_json() {
    let mut server = Server::new_async().await;
    let content = "Here you go:\n```json\n{\"is_valid_cluster\": true, \"similarity_score\": 0.82, \
                   \"name\": \"Invoice reconciliation\", \"description\": \"Manual matching\", \
                   \"confidence\": 0.9, \"reasoning\": \"same task\"}\n```";
    let mock = server
      .mock("POST", "/chat/completions")
      .match_header("authorization", "Bearer sk-test")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(completion(content))
      .create_async()
      .await;

    let assessment = judge_for(&server).assess_group(&request()).await.unwrap();
    mock.assert_async().await;
    match assessment {
      Assessment::Response(response) => {
        assert!(response.is_valid_cluster);
        assert_eq!(response.name, "Invoice reconciliation");
        assert!((response.similarity_score - 0.82).abs() < 1e-6);
      }
      other => panic!("expected a response, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_non_success_status_is_unusable() {
    let mut server = Server::new_async().await;
    let _mock = server.mock("POST", "/chat/completions").with_status(503).create_async().await;

    let assessment = judge_for(&server).assess_group(&request()).await.unwrap();
    assert!(matches!(assessment, Assessment::Unusable(_)));
  }

  #[tokio::test]
  async fn test_prose_reply_is_unusable() {
    let mut server = Server::new_async().await;
    let _mock = server
      .mock("POST", "/chat/completions")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(completion("These look related but I am not sure."))
      .create_async()
      .await;

    let assessment = judge_for(&server).assess_group(&request()).await.unwrap();
    assert!(matches!(assessment, Assessment::Unusable(_)));
  }

  #[tokio::test]
  async fn test_summarize() {
    let mut server = Server::new_async().await;
    let _mock = server
      .mock("POST", "/chat/completions")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(completion(r#"{"name": "Invoice matching", "description": "Matching invoices by hand"}"#))
      .create_async()
      .await;

    let summary = judge_for(&server).summarize_cluster(&request()).await.unwrap().unwrap();
    assert_eq!(summary.name, "Invoice matching");
  }

  #[tokio::test]
  async fn test_connection_refused_is_transport_error() {
    let config = JudgeConfig {
      base_url: "http://127.0.0.1:9".to_string(),
      model: "m".to_string(),
      api_key: None,
    };
    let judge = HttpSemanticJudge::new(&config, Duration::from_secs(2)).unwrap();
    let err = judge.assess_group(&request()).await.unwrap_err();
    assert!(err.is_transient());
  }

  #[test]
  fn test_decode_object_rejects_garbage() {
    assert!(decode_object::<ClusterSummary>("no braces").is_none());
    assert!(decode_object::<ClusterSummary>("} backwards {").is_none());
  }
}
