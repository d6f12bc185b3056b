//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`. Thread names are shown
/// because transfers complete on the USB worker and executor threads.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialised: {}", e)))?;

    Ok(())
}

fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}
