//! Diagnostic logging setup.
//!
//! Installs a global tracing subscriber writing to stdout. The level comes from
//! `RUST_LOG` and defaults to `info`.

use std::sync::OnceLock;

use tracing_subscriber::{
    fmt,
    prelude::*,
    EnvFilter,
    Registry,
};

use crate::core::ConsoleError;

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing. Subsequent calls are no-ops.
pub fn init() -> Result<(), ConsoleError> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let subscriber = Registry::default()
        .with(build_env_filter())
        .with(fmt::layer().with_target(true).with_writer(std::io::stdout));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ConsoleError::Logging(e.to_string()))?;
    let _ = INITIALIZED.set(());

    tracing::info!("Logging initialized");
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
