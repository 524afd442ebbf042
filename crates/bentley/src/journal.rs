//! Replay journal for pipeline runs
//!
//! An append-only JSONL file recording per-record failures and reconciliation
//! events with enough context (stage, record id, cluster id, run id) to replay
//! them later. Entries are echoed through the regular bentley levels unless
//! the journal is opened silent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

// Types and Data Structures
// =========================

/// Severity of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
  Info,
  Warn,
  Error,
}

impl Level {
  pub fn as_str(&self) -> &'static str {
    match self {
      Level::Info => "info",
      Level::Warn => "warn",
      Level::Error => "error",
    }
  }
}

/// A single journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
  pub timestamp: DateTime<Utc>,
  pub level: Level,
  /// Pipeline stage that produced the entry (e.g. "assign", "expire")
  pub stage: String,
  pub message: String,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub record_id: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub cluster_id: Option<String>,

  /// Run identifier for correlating entries from one pass
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub run_id: Option<String>,
}

impl JournalEntry {
  pub fn new(level: Level, stage: &str, message: impl Into<String>) -> Self {
    Self {
      timestamp: Utc::now(),
      level,
      stage: stage.to_string(),
      message: message.into(),
      record_id: None,
      cluster_id: None,
      run_id: None,
    }
  }

  pub fn with_record(mut self, record_id: &str) -> Self {
    self.record_id = Some(record_id.to_string());
    self
  }

  pub fn with_cluster(mut self, cluster_id: &str) -> Self {
    self.cluster_id = Some(cluster_id.to_string());
    self
  }

  pub fn with_run(mut self, run_id: &str) -> Self {
    self.run_id = Some(run_id.to_string());
    self
  }

  /// One-line rendering used for console echo and CLI listing
  pub fn render(&self) -> String {
    let mut line = format!("[{}] {}", self.stage, self.message);
    if let Some(record_id) = &self.record_id {
      line.push_str(&format!(" (record {record_id})"));
    }
    if let Some(cluster_id) = &self.cluster_id {
      line.push_str(&format!(" (cluster {cluster_id})"));
    }
    line
  }
}

/// Filter applied when reading the journal back
#[derive(Debug, Clone, Default)]
pub struct JournalQuery {
  pub limit: Option<usize>,
  pub stage: Option<String>,
  pub level: Option<Level>,
}

struct JournalInner {
  path: PathBuf,
  silent: bool,
}

/// Thread-safe, file-backed replay journal
#[derive(Clone)]
pub struct Journal {
  inner: Arc<Mutex<JournalInner>>,
}

// Constructor Functions
// =====================

impl JournalInner {
  fn open(path: &Path, silent: bool) -> std::io::Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    // Create the file if needed, never truncate
    if !path.exists() {
      File::create(path)?;
    }

    Ok(Self { path: path.to_path_buf(), silent })
  }

  fn append(&mut self, entry: &JournalEntry) -> std::io::Result<()> {
    let json_line = serde_json::to_string(entry)
      .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
    writeln!(file, "{json_line}")?;
    file.flush()
  }

  fn read(&self, query: &JournalQuery) -> std::io::Result<Vec<JournalEntry>> {
    if !self.path.exists() {
      return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(&self.path)?);
    let mut entries = Vec::new();

    for line in reader.lines() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }

      // Skip lines from a torn write
      let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) else {
        continue;
      };

      let stage_matches = query.stage.as_deref().is_none_or(|stage| entry.stage == stage);
      let level_matches = query.level.is_none_or(|level| entry.level == level);
      if stage_matches && level_matches {
        entries.push(entry);
      }
    }

    // Keep the most recent N, oldest first for terminal display
    if let Some(limit) = query.limit {
      if entries.len() > limit {
        entries.drain(..entries.len() - limit);
      }
    }

    Ok(entries)
  }
}

// Core API
// ========

impl Journal {
  /// Open (or create) a journal at the given path
  pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
    Self::open_with_silent(path, false)
  }

  /// Open a journal, optionally without echoing entries to the log
  pub fn open_with_silent<P: AsRef<Path>>(path: P, silent: bool) -> std::io::Result<Self> {
    let inner = JournalInner::open(path.as_ref(), silent)?;
    Ok(Self { inner: Arc::new(Mutex::new(inner)) })
  }

  /// Append an entry, returning any I/O failure
  pub async fn append(&self, entry: &JournalEntry) -> std::io::Result<()> {
    let mut guard = self.inner.lock().await;
    guard.append(entry)?;

    if !guard.silent {
      let line = entry.render();
      match entry.level {
        Level::Info => crate::info(&line),
        Level::Warn => crate::warn(&line),
        Level::Error => crate::error(&line),
      }
    }
    Ok(())
  }

  /// Append an entry, logging instead of failing when the file is unwritable
  pub async fn record(&self, entry: JournalEntry) {
    if let Err(e) = self.append(&entry).await {
      crate::error!("journal write failed ({e}): {}", entry.render());
    }
  }

  /// Read entries back with optional filters
  pub async fn read(&self, query: &JournalQuery) -> std::io::Result<Vec<JournalEntry>> {
    let guard = self.inner.lock().await;
    guard.read(query)
  }

  /// Path of the backing file
  pub async fn path(&self) -> PathBuf {
    let guard = self.inner.lock().await;
    guard.path.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[tokio::test]
  async fn test_append_and_read_back() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::open_with_silent(dir.path().join("runs/journal.jsonl"), true).unwrap();

    journal
      .append(&JournalEntry::new(Level::Warn, "assign", "judge timed out").with_record("p-1"))
      .await
      .unwrap();
    journal.append(&JournalEntry::new(Level::Info, "expire", "deleted 3 orphans")).await.unwrap();

    let all = journal.read(&JournalQuery::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].record_id.as_deref(), Some("p-1"));

    let assign_only = journal
      .read(&JournalQuery { stage: Some("assign".to_string()), ..Default::default() })
      .await
      .unwrap();
    assert_eq!(assign_only.len(), 1);
    assert_eq!(assign_only[0].message, "judge timed out");
  }

  #[tokio::test]
  async fn test_limit_keeps_most_recent() {
    let dir = TempDir::new().unwrap();
    let journal = Journal::open_with_silent(dir.path().join("journal.jsonl"), true).unwrap();

    for i in 0..5 {
      journal.record(JournalEntry::new(Level::Error, "expire", format!("failure {i}"))).await;
    }

    let entries =
      journal.read(&JournalQuery { limit: Some(2), ..Default::default() }).await.unwrap();
    let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["failure 3", "failure 4"]);
  }

  #[tokio::test]
  async fn test_torn_lines_are_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal.jsonl");
    let journal = Journal::open_with_silent(&path, true).unwrap();
    journal.record(JournalEntry::new(Level::Info, "sync", "replayed")).await;

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, "{{\"timestamp\": \"2026-").unwrap();

    let entries = journal.read(&JournalQuery::default()).await.unwrap();
    assert_eq!(entries.len(), 1);
  }

  #[test]
  fn test_render_includes_ids() {
    let entry =
      JournalEntry::new(Level::Warn, "lifecycle", "dissolved").with_cluster("reddit_03").with_run("r1");
    assert_eq!(entry.render(), "[lifecycle] dissolved (cluster reddit_03)");
  }
}
