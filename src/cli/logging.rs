//! Tracing initialisation for the command-line front end

use crate::config::{ConfigError, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// File name prefix of the rotated log files
const LOG_FILE_PREFIX: &str = "cctalk.log";

/// Build the level filter: `RUST_LOG` wins over `level`
pub fn env_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| ConfigError::Invalid(format!("log level '{level}': {e}"))),
    }
}

/// Install the global subscriber
///
/// Console output goes to stderr so stdout stays free for command results.
/// With a log directory configured, a daily rotated file is written as well;
/// keep the returned guard alive until exit or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();
    let mut guard = None;

    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let console = if config.json {
        console.json().boxed()
    } else {
        console.compact().boxed()
    };
    layers.push(console.with_filter(env_filter(&config.level)?).boxed());

    if let Some(directory) = &config.directory {
        std::fs::create_dir_all(directory)?;
        let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        let file = fmt::layer().with_writer(writer).with_ansi(false);
        let file = if config.json {
            file.json().boxed()
        } else {
            file.boxed()
        };
        layers.push(file.with_filter(env_filter(&config.level)?).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| ConfigError::Invalid(format!("failed to initialise logging: {e}")))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(env_filter("info").is_ok());
        assert!(env_filter("cctalk_core=trace,warn").is_ok());
        assert!(matches!(env_filter("[bad"), Err(ConfigError::Invalid(_))));
    }
}
