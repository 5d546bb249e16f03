//! Tracing setup for the command-line client.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level; `verbose` raises the configured
/// level to `debug`. The returned guard must be held until exit or buffered
/// file output is lost.
pub fn init(config: &Config, verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = match EnvFilter::try_from_default_env() {
    Ok(filter) => filter,
    Err(_) => EnvFilter::try_new(fallback_level(config, verbose))
      .map_err(|e| eyre!("Invalid log level {:?}: {}", config.log.level, e))?,
  };

  let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

  let (file, guard) = if config.log.file {
    let dir = config.data_dir()?.join("logs");
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "sisa.log"));
    (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(console)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn fallback_level(config: &Config, verbose: bool) -> &str {
  if verbose {
    "debug"
  } else {
    &config.log.level
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_verbose_overrides_configured_level() {
    let mut config = Config::default();
    config.log.level = "warn".to_string();

    assert_eq!(fallback_level(&config, false), "warn");
    assert_eq!(fallback_level(&config, true), "debug");
  }
}
