//! Structured logging setup.
//!
//! The library itself only emits `tracing` events. Applications (and the
//! integration tests) call [`init_logging`] once to install a subscriber built
//! from [`LoggingConfig`]. `RUST_LOG`, when set, wins over the configured level.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::ConfigError;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global `tracing` subscriber described by `config`.
///
/// # Errors
/// Returns `ConfigError::Invalid` if the log file cannot be opened or a global
/// subscriber is already installed
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.log_to_console {
        let layer = fmt::layer().with_target(true).with_thread_ids(true);
        layers.push(if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ConfigError::Invalid("log_file_path must be set when log_to_file is true".into())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ConfigError::Invalid(format!("Failed to open log file {path}: {e}")))?;
        let layer = fmt::layer().with_ansi(false).with_writer(Arc::new(file));
        layers.push(if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ConfigError::Invalid(format!("Failed to install subscriber: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

/// Best-effort console logging for tests and examples; ignores a subscriber
/// that is already installed.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
