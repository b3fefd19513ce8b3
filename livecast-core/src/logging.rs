//! Tracing subscriber setup.

use crate::conf::LoggingConfig;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber per the logging configuration.
///
/// `RUST_LOG` wins over the configured level. The format is `pretty` for
/// interactive use or `json` for machine-readable output, optionally
/// appended to a file instead of stderr.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow::anyhow!("invalid log level '{}': {e}", config.level))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match (config.format.as_str(), &config.file_path) {
        ("json", Some(path)) => builder
            .json()
            .with_writer(Arc::new(open_log_file(path)?))
            .init(),
        ("json", None) => builder.json().init(),
        (_, Some(path)) => builder.with_writer(Arc::new(open_log_file(path)?)).init(),
        (_, None) => builder.init(),
    }
    Ok(())
}

fn open_log_file(path: &str) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}
