//! Structured logging setup.
//!
//! `RUST_LOG` wins when set and valid; otherwise the configured level
//! applies. Logs go to stderr.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::CoreError;

/// Build the filter from `RUST_LOG` (if set) or `level`.
///
/// # Errors
///
/// Returns [`CoreError::Telemetry`] if the fallback `level` is not a
/// valid directive.
pub fn env_filter(level: &str) -> Result<EnvFilter, CoreError> {
    build_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(), level)
}

fn build_filter(from_env: Option<&str>, level: &str) -> Result<EnvFilter, CoreError> {
    if let Some(filter) = from_env.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| CoreError::Telemetry {
        message: format!("bad log level {level:?}: {e}"),
    })
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns [`CoreError::Telemetry`] if the filter is invalid or a
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), CoreError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.level)?)
        .with_target(true)
        .with_writer(std::io::stderr);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| CoreError::Telemetry {
        message: e.to_string(),
    })
}
