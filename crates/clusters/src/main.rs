use anyhow::{Context, Result};
use bentley::journal::{JournalQuery, Level};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use clusters::detector::DetectOptions;
use clusters::pipeline::Pipeline;
use clusters::{ClustersConfig, ProblemRecord};

#[derive(Parser)]
#[command(name = "clusters")]
#[command(about = "Clusters - Problem Cluster Lifecycle Engine\nGroups problem statements into clusters")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), ", courtesy of Kernelle Software"))]
struct Cli {
  /// Configuration file (.yaml, .yml or .json)
  #[arg(short, long, global = true, env = "CLUSTERS_CONFIG")]
  config: Option<PathBuf>,

  /// Enable verbose logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Print reports as JSON on stdout
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Command,
}

/// Embedded problem records, one JSON object per line
#[derive(Args)]
struct Input {
  /// JSONL file of records, or `-` for stdin
  input: PathBuf,
}

#[derive(Subcommand)]
enum Command {
  /// Seed clusters from a bounded pool of records
  Build {
    #[command(flatten)]
    input: Input,
  },
  /// Route new records into clusters without housekeeping
  Assign {
    #[command(flatten)]
    input: Input,
  },
  /// Full pass: backlog replay, assignment, lifecycle, change detection
  Run {
    /// Incoming records; omit to only retry deferred work
    input: Option<PathBuf>,
    /// Record a periodic snapshot for every inspected cluster
    #[arg(long)]
    snapshot: bool,
  },
  /// List clusters whose metrics changed since their last snapshot
  Changes {
    /// Record a periodic snapshot for every inspected cluster
    #[arg(long)]
    snapshot: bool,
    /// Only list clusters due for a time-based refresh
    #[arg(long)]
    due: bool,
  },
  /// Orphan marking, consistency repair, orphan expiry and archival
  Cleanup,
  /// Show replay journal entries
  Journal {
    /// Maximum number of entries to show
    #[arg(short, long, default_value = "50")]
    limit: usize,
    /// Filter by stage (archive, assign, build, expire, index-sync, repair)
    #[arg(long)]
    stage: Option<String>,
    /// Filter by level (info, warn, error, all)
    #[arg(long, default_value = "all")]
    level: String,
  },
}

fn read_records(path: &Path) -> Result<Vec<ProblemRecord>> {
  let reader: Box<dyn BufRead> = if path == Path::new("-") {
    Box::new(BufReader::new(std::io::stdin()))
  } else {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Box::new(BufReader::new(file))
  };

  let mut records = Vec::new();
  for (number, line) in reader.lines().enumerate() {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }
    let record: ProblemRecord = serde_json::from_str(&line)
      .with_context(|| format!("{}:{}: invalid problem record", path.display(), number + 1))?;
    records.push(record);
  }
  Ok(records)
}

fn parse_level(level: &str) -> Result<Option<Level>> {
  match level {
    "all" => Ok(None),
    "info" => Ok(Some(Level::Info)),
    "warn" => Ok(Some(Level::Warn)),
    "error" => Ok(Some(Level::Error)),
    other => anyhow::bail!("unknown level '{other}' (expected info, warn, error or all)"),
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

async fn handle(cli: Cli) -> Result<()> {
  let config = ClustersConfig::load(cli.config.as_deref())?;
  let pipeline = Pipeline::open(&config).await?;
  let now = Utc::now();

  match cli.command {
    Command::Build { input } => {
      let records = read_records(&input.input)?;
      bentley::announce(&format!("Batch build over {} records", records.len()));
      let report = pipeline.build(&records, now).await?;
      if cli.json {
        return print_json(&report);
      }
      bentley::report(
        "Batch build",
        &[
          ("clusters created", report.clusters_created.join(", ")),
          ("records clustered", report.clustered_records.to_string()),
          ("records orphaned", report.orphaned_records.to_string()),
          ("already active", report.skipped_active.to_string()),
          ("skipped partitions", report.skipped_partitions.join(", ")),
          ("rejected groups", report.rejected_groups.to_string()),
          ("failed groups", report.failed_groups.to_string()),
        ],
      );
    }
    Command::Assign { input } => {
      let records = read_records(&input.input)?;
      let report = pipeline.assign(&records, now).await?;
      if cli.json {
        return print_json(&report);
      }
      bentley::report(
        "Assignment",
        &[
          ("merged", report.merged.to_string()),
          ("founded", report.founded.join(", ")),
          ("orphaned", report.orphaned.to_string()),
          ("unchanged", report.unchanged.to_string()),
          ("deferred", report.deferred.to_string()),
        ],
      );
    }
    Command::Run { input, snapshot } => {
      let records = match input {
        Some(path) => read_records(&path)?,
        None => Vec::new(),
      };
      let options = DetectOptions { write_periodic_snapshots: snapshot };
      let summary = pipeline.run(&records, now, options).await?;
      if cli.json {
        return print_json(&summary);
      }
      bentley::log(&summary.to_string());
    }
    Command::Changes { snapshot, due } => {
      if due {
        let ids = pipeline.detector().refresh_due(now).await?;
        if cli.json {
          return print_json(&ids);
        }
        for id in ids {
          println!("{id}");
        }
        return Ok(());
      }
      let options = DetectOptions { write_periodic_snapshots: snapshot };
      let report = pipeline.changes(now, options).await?;
      if cli.json {
        return print_json(&report);
      }
      for trigger in &report.triggers {
        println!(
          "{:<6} {:<20} Δ{:<5} {}",
          trigger.priority.as_str(),
          trigger.cluster_id,
          trigger.size_delta,
          trigger.reasons.join(", ")
        );
      }
    }
    Command::Cleanup => {
      let report = pipeline.cleanup(now).await?;
      if cli.json {
        return print_json(&report);
      }
      bentley::report(
        "Cleanup",
        &[
          ("marked orphan", report.marked_orphans.to_string()),
          ("repaired dangling", report.repaired_dangling.to_string()),
          ("dissolved", report.dissolved_clusters.join(", ")),
          ("expired orphans", report.expired_orphans.to_string()),
          ("deletion failures", report.deletion_failures.join(", ")),
          ("archived", report.archived_clusters.join(", ")),
        ],
      );
    }
    Command::Journal { limit, stage, level } => {
      let query = JournalQuery { limit: Some(limit), stage, level: parse_level(&level)? };
      let Some(journal) = pipeline.journal().journal() else {
        return Ok(());
      };
      let entries = journal.read(&query).await?;
      if cli.json {
        return print_json(&entries);
      }
      for entry in entries {
        let at = entry.timestamp.format("%Y-%m-%d %H:%M:%S");
        println!("{at} {:<5} {}", entry.level.as_str(), entry.render());
      }
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  // RUST_LOG wins; otherwise keep sqlx quiet unless asked
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    if cli.verbose {
      EnvFilter::new("bentley=trace,clusters=debug,sqlx=warn,info")
    } else {
      EnvFilter::new("bentley=info,clusters=info,sqlx=error,warn")
    }
  });
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(filter)
    .init();

  handle(cli).await
}
