use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "fieldpost.log";

/// Log to stderr and to `<data dir>/fieldpost.log`.
///
/// The directory can be overridden with FIELDPOST_LOG_DIR. Keep the returned
/// guard alive for the life of the process or buffered lines are lost.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
  let log_dir = match std::env::var_os("FIELDPOST_LOG_DIR") {
    Some(dir) => PathBuf::from(dir),
    None => crate::config::data_dir()?,
  };
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "fieldpost=info,warn".into()))
    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
    .with(fmt::layer().with_writer(std::io::stderr))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok((guard, log_dir.join(LOG_FILE)))
}
