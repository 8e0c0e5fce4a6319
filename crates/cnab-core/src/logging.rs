//! Logging bootstrap for consumers embedding this crate.
//!
//! `cnab-core` never calls this itself — drivers and the action engine only
//! emit `tracing` events. A host binary that wants console output calls
//! [`init`] once at startup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize a default `tracing` subscriber (env-filtered, human formatted).
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("cnab-core logging initialized");
    Ok(())
}
