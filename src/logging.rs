use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Variable holding the log filter, e.g. `duojournal=debug`.
pub const LOG_VAR: &str = "DUOJOURNAL_LOG";

fn filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Directory for rolled log files.
pub fn log_dir() -> PathBuf {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .unwrap_or_else(|| PathBuf::from("."))
    .join("duojournal")
    .join("logs")
}

/// Log to stderr.
pub fn init_stderr() {
  tracing_subscriber::fmt()
    .with_env_filter(filter())
    .with_writer(std::io::stderr)
    .init();
}

/// Log to a daily-rolled file so command output stays clean.
///
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init_file() -> Option<WorkerGuard> {
  let dir = log_dir();
  if std::fs::create_dir_all(&dir).is_err() {
    // Nowhere to write; only errors go to stderr.
    tracing_subscriber::fmt()
      .with_max_level(tracing::Level::ERROR)
      .with_writer(std::io::stderr)
      .init();
    return None;
  }

  let appender = tracing_appender::rolling::daily(dir, "duojournal.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter())
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}
