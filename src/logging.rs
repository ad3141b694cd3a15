//! Tracing setup for the operator CLI and embedding hosts.

use std::fs;
use std::path::PathBuf;

use tracing::metadata::LevelFilter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "mealsync.log";
/// Overrides the verbosity-derived filter, e.g. `MEALSYNC_LOG=mealsync::queue=debug`
pub const LOG_ENV_VAR: &str = "MEALSYNC_LOG";

/// Keeps the non-blocking file writer flushing until dropped.
pub struct LoggingGuard {
  _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber: stderr always, plus a daily-rotated file
/// when `config.file` is set.
pub fn init(config: &LoggingConfig, verbosity: u8) -> LoggingGuard {
  let filter = EnvFilter::builder()
    .with_default_directive(level_from_verbosity(verbosity).into())
    .with_env_var(LOG_ENV_VAR)
    .from_env_lossy();

  let mut guards = Vec::new();
  let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![Box::new(
    tracing_subscriber::fmt::layer()
      .compact()
      .with_writer(std::io::stderr)
      .with_target(true),
  )];

  let mut setup_error = None;
  if config.file {
    let dir = log_dir(config);
    match fs::create_dir_all(&dir) {
      Ok(()) => {
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(Box::new(
          tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_target(true),
        ));
        guards.push(guard);
      }
      Err(err) => {
        setup_error = Some(format!("log dir init failed for {}: {}", dir.display(), err));
      }
    }
  }

  layers.push(Box::new(filter));
  Registry::default().with(layers).init();

  if let Some(error) = setup_error {
    tracing::warn!("{}", error);
  }

  LoggingGuard { _guards: guards }
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
  match verbosity {
    0 => LevelFilter::WARN,
    1 => LevelFilter::INFO,
    _ => LevelFilter::DEBUG,
  }
}

/// Configured directory, else `$XDG_STATE_HOME/mealsync/logs`.
pub fn log_dir(config: &LoggingConfig) -> PathBuf {
  config.dir.clone().unwrap_or_else(|| {
    dirs::state_dir()
      .or_else(dirs::data_local_dir)
      .unwrap_or_else(std::env::temp_dir)
      .join("mealsync")
      .join("logs")
  })
}
