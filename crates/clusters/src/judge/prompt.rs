//! Prompt text for the HTTP judge

use super::JudgeRequest;

pub const ASSESS_SYSTEM: &str = "You review groups of user-reported problems. Decide whether \
every statement in the group describes the same recurring workflow pain. Reply with a single JSON \
object and nothing else, using the keys: is_valid_cluster (boolean), similarity_score (number \
between 0 and 1), name (short title for the workflow), description (one or two sentences), \
confidence (number between 0 and 1), reasoning (one sentence).";

pub const SUMMARIZE_SYSTEM: &str = "You name clusters of user-reported problems that describe the \
same workflow pain. Reply with a single JSON object and nothing else, using the keys: name (short \
title for the workflow) and description (one or two sentences).";

/// Numbered problem list shared by both prompts
pub fn render_items(request: &JudgeRequest) -> String {
  let mut out = String::new();
  if let Some(source) = &request.source_type {
    out.push_str(&format!("Source: {source}\n\n"));
  }
  for (i, item) in request.items.iter().enumerate() {
    out.push_str(&format!("{}. Problem: {}\n", i + 1, item.problem.trim()));
    if !item.context.trim().is_empty() {
      out.push_str(&format!("   Context: {}\n", item.context.trim()));
    }
    if !item.workaround.trim().is_empty() {
      out.push_str(&format!("   Workaround: {}\n", item.workaround.trim()));
    }
  }
  out
}

pub fn assess_user(request: &JudgeRequest) -> String {
  format!("Do these {} problems form one workflow?\n\n{}", request.items.len(), render_items(request))
}

pub fn summarize_user(request: &JudgeRequest) -> String {
  format!("Name the workflow these {} problems share.\n\n{}", request.items.len(), render_items(request))
}
