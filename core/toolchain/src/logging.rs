//! Logging init: `tracing` events to stderr, filtered by `RUST_LOG`.
//!
//! The library only emits events. Binaries and tests that want to see them
//! call [`init_logging`] once at startup.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info,inference_toolchain=debug";

/// Installs a stderr `fmt` subscriber as the global default.
///
/// Returns `Ok(())` without doing anything if a global subscriber is already
/// set, so repeated calls are harmless.
///
/// # Errors
///
/// Returns an error if the subscriber cannot be installed.
pub fn init_logging() -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to install tracing subscriber")?;

    tracing::debug!("logging initialized");
    Ok(())
}
