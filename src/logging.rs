use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::config::LogConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level; `verbose` forces
/// debug output. When a log file is configured, records go there through a
/// non-blocking writer whose guard must be kept alive until exit.
pub fn init(config: &LogConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = if verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
  };

  match &config.file {
    Some(path) => {
      let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;

      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        directory, file_name,
      ));

      tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .with(filter)
        .try_init()
        .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(
          fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init()
        .map_err(|e| eyre!("Failed to initialise logging: {}", e))?;

      Ok(None)
    }
  }
}
