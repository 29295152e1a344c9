//! Logging setup for the frame graph and its host applications.
//!
//! Built on the `tracing` ecosystem. Console output goes to stdout as text or
//! JSON; an optional daily-rotated log file gets the same format without ANSI
//! colors. `RUST_LOG` takes precedence over the configured level so a single
//! module can be turned up without editing the configuration.
//!
//! Vulkan validation messages are emitted under the `vulkan` target, so
//! `RUST_LOG=vulkan=debug` isolates them.

use crate::config::LoggingConfig;
use crate::error::{RenderGraphError, Result};

use once_cell::sync::Lazy;
use std::io::stdout;
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Initializes a minimal logging setup writing to `stderr`.
///
/// Intended for tests and for early startup before the configuration is
/// loaded. Filters with `RUST_LOG`, defaulting to "info". Errors (a global
/// subscriber already set) are ignored.
pub fn init_minimal_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .try_init();
}

/// Keeps the file writer alive so buffered lines are flushed on exit.
static LOG_WORKER_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

fn level_directive(level: &str) -> Result<String> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        invalid => {
            return Err(RenderGraphError::Initialization(format!(
                "invalid log level in config: {}",
                invalid
            )))
        }
    };
    Ok(level.to_string())
}

fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

fn create_file_layer(
    log_path: &Path,
    format: &str,
    directive: &str,
) -> Result<(Box<dyn Layer<Registry> + Send + Sync + 'static>, WorkerGuard)> {
    let directory = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(directory).map_err(|e| {
        RenderGraphError::Initialization(format!(
            "cannot create log directory {:?}: {}",
            directory, e
        ))
    })?;
    let file_name = log_path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("frame-graph.log"));

    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = match format {
        "json" => fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(build_filter(directive))
            .boxed(),
        _ => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(build_filter(directive))
            .boxed(),
    };
    Ok((layer, guard))
}

/// Installs the global subscriber described by `config`.
///
/// # Errors
///
/// Returns `RenderGraphError::Initialization` for an invalid level, an
/// unusable log directory, or when a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let directive = level_directive(&config.level)?;
    let format = config.format.to_lowercase();

    let stdout_layer = match format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_writer(stdout)
            .with_ansi(false)
            .with_filter(build_filter(&directive))
            .boxed(),
        _ => fmt::layer()
            .with_writer(stdout)
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_filter(build_filter(&directive))
            .boxed(),
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync + 'static>> = vec![stdout_layer];
    let mut guard = None;
    if let Some(path) = &config.file_path {
        let (layer, file_guard) = create_file_layer(path, &format, &directive)?;
        layers.push(layer);
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| {
            RenderGraphError::Initialization(format!("failed to set global subscriber: {}", e))
        })?;

    if let Some(guard) = guard {
        if let Ok(mut slot) = LOG_WORKER_GUARD.lock() {
            *slot = Some(guard);
        }
    }

    tracing::info!(
        level = %config.level,
        format = %format,
        file = ?config.file_path,
        "Logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_directive_accepts_any_case() {
        assert_eq!(level_directive("DEBUG").unwrap(), Level::DEBUG.to_string());
        assert_eq!(level_directive("warn").unwrap(), Level::WARN.to_string());
    }

    #[test]
    fn invalid_level_is_rejected_before_installing_anything() {
        let config = LoggingConfig {
            level: "verbose".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(RenderGraphError::Initialization(_))
        ));
    }

    #[test]
    fn minimal_logging_can_be_called_twice() {
        init_minimal_logging();
        init_minimal_logging();
    }
}
