//! Run-scoped wrapper around the bentley replay journal

use bentley::journal::{Journal, JournalEntry, Level};

/// Journal handle shared by every component in one pipeline pass.
///
/// Without a backing file, entries still go to the log so nothing is lost
/// from the operator's view.
#[derive(Clone)]
pub struct RunJournal {
  journal: Option<Journal>,
  run_id: String,
}

impl Default for RunJournal {
  fn default() -> Self {
    Self::disabled()
  }
}

impl RunJournal {
  pub fn disabled() -> Self {
    Self { journal: None, run_id: new_run_id() }
  }

  pub fn new(journal: Journal) -> Self {
    Self { journal: Some(journal), run_id: new_run_id() }
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  pub fn journal(&self) -> Option<&Journal> {
    self.journal.as_ref()
  }

  pub async fn record(&self, entry: JournalEntry) {
    let entry = entry.with_run(&self.run_id);
    match &self.journal {
      Some(journal) => journal.record(entry).await,
      None => match entry.level {
        Level::Info => bentley::info(&entry.render()),
        Level::Warn => bentley::warn(&entry.render()),
        Level::Error => bentley::error(&entry.render()),
      },
    }
  }

  pub async fn warn(&self, stage: &str, message: impl Into<String>, record_id: Option<&str>) {
    self.record(with_record(JournalEntry::new(Level::Warn, stage, message), record_id)).await;
  }

  pub async fn error(&self, stage: &str, message: impl Into<String>, record_id: Option<&str>) {
    self.record(with_record(JournalEntry::new(Level::Error, stage, message), record_id)).await;
  }

  /// Entry about a whole cluster, filterable by cluster id on replay
  pub async fn cluster(
    &self,
    level: Level,
    stage: &str,
    message: impl Into<String>,
    cluster_id: &str,
  ) {
    self.record(JournalEntry::new(level, stage, message).with_cluster(cluster_id)).await;
  }
}

fn with_record(entry: JournalEntry, record_id: Option<&str>) -> JournalEntry {
  match record_id {
    Some(id) => entry.with_record(id),
    None => entry,
  }
}

fn new_run_id() -> String {
  uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
