//! Logging setup and configuration

use crate::config::LoggingSettings;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` wins over `default_level`. Fails if a global subscriber is
/// already installed.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::AccessoryError::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| crate::AccessoryError::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

pub fn setup_logging_from(settings: &LoggingSettings) -> crate::Result<()> {
    setup_logging(&settings.level)
}
