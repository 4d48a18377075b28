// src/utils/config.rs
//! Engine configuration
//!
//! Built from defaults with `VMSIM_*` environment overrides, e.g.
//! `VMSIM_AGENT__COUNT=4` or `VMSIM_DATABASE__PATH=/var/lib/vmsim/sim.db`.

use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub agent: AgentConfig,
    pub vm: VmConfig,
}

/// Job store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
}

/// Agent pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Number of independent polling agents
    pub count: usize,

    /// Seconds between poll iterations
    pub poll_interval_secs: u64,
}

/// VM process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// Path to the opaque boot script, invoked as `<script> <vm_name> <timeout>`
    pub script_path: PathBuf,

    /// Timeout applied when a submission omits one
    pub default_timeout_secs: u64,

    /// Upper bound a submitted timeout is clamped to
    pub max_timeout_secs: u64,
}

impl EngineConfig {
    /// Load configuration from defaults and the environment
    pub fn load() -> Result<Self> {
        let cfg = config::Config::builder()
            .set_default("database.path", "simulation.db")
            .and_then(|b| b.set_default("agent.count", 1))
            .and_then(|b| b.set_default("agent.poll_interval_secs", 5))
            .and_then(|b| b.set_default("vm.script_path", "./scripts/qemu_runner.sh"))
            .and_then(|b| b.set_default("vm.default_timeout_secs", 300))
            .and_then(|b| b.set_default("vm.max_timeout_secs", 3600))
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?
            .add_source(
                config::Environment::with_prefix("VMSIM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;

        cfg.try_deserialize()
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))
    }

    /// Validate value ranges; returns every problem found
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.agent.count < 1 {
            errors.push("agent.count must be at least 1".to_string());
        }
        if self.agent.poll_interval_secs < 1 {
            errors.push("agent.poll_interval_secs must be at least 1 second".to_string());
        }
        if self.vm.default_timeout_secs < 1 {
            errors.push("vm.default_timeout_secs must be at least 1 second".to_string());
        }
        if self.vm.max_timeout_secs < self.vm.default_timeout_secs {
            errors.push("vm.max_timeout_secs must be >= vm.default_timeout_secs".to_string());
        }
        if !self.vm.script_path.exists() {
            errors.push(format!(
                "VM boot script not found: {}",
                self.vm.script_path.display()
            ));
        }

        errors
    }
}
