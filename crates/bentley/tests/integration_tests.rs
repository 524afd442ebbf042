use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// Shared buffer the test subscriber writes formatted events into
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
  fn text(&self) -> String {
    String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
  }
}

impl Write for Captured {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.0.lock().unwrap().extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

impl<'a> MakeWriter<'a> for Captured {
  type Writer = Captured;

  fn make_writer(&'a self) -> Self::Writer {
    self.clone()
  }
}

fn capture(max_level: tracing::Level, body: impl FnOnce()) -> String {
  let out = Captured::default();
  let subscriber = tracing_subscriber::fmt()
    .with_writer(out.clone())
    .with_max_level(max_level)
    .with_ansi(false)
    .finish();
  tracing::subscriber::with_default(subscriber, body);
  out.text()
}

#[test]
fn test_levels_emit_under_bentley_target() {
  let out = capture(tracing::Level::TRACE, || {
    bentley::info("merged 3 records");
    bentley::warn("index write queued");
    bentley::error("store unreachable");
    bentley::verbose("scored candidate");
  });

  assert!(out.contains("INFO bentley: merged 3 records"));
  assert!(out.contains("WARN bentley: index write queued"));
  assert!(out.contains("ERROR bentley: store unreachable"));
  assert!(out.contains("TRACE bentley: scored candidate"));
}

#[test]
fn test_events_use_exported_target() {
  let out = capture(tracing::Level::DEBUG, || {
    bentley::debug("candidate window");
  });

  assert!(out.contains(&format!("DEBUG {}: candidate window", bentley::TARGET)));
}

#[test]
fn test_multiline_messages_become_one_event_per_line() {
  let out = capture(tracing::Level::INFO, || {
    bentley::info("first line\nsecond line");
  });

  assert_eq!(out.lines().filter(|line| line.contains("bentley:")).count(), 2);
}

#[test]
fn test_macros_format_arguments() {
  let count = 4;
  let out = capture(tracing::Level::INFO, || {
    bentley::success!("Created cluster {} with {count} members", "reddit_01");
  });

  assert!(out.contains("Created cluster reddit_01 with 4 members"));
  assert!(out.contains("outcome=\"success\""));
}

#[test]
fn test_verbose_hidden_at_info() {
  let out = capture(tracing::Level::INFO, || {
    bentley::verbose!("neighbor cluster {} skipped", "hn_02");
  });

  assert!(out.is_empty());
}
