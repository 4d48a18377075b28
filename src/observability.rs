// src/observability.rs
//! Tracing initialization
//!
//! Structured logging via `tracing`; the filter is taken from `RUST_LOG`
//! and defaults to `info`.

use crate::utils::errors::{EngineError, Result};
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| EngineError::RuntimeError(format!("failed to init tracing: {}", e)))
}
