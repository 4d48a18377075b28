// src/lib.rs
//! VM Simulation Engine Library
//!
//! This library provides the core components for queueing VM execution
//! jobs and running them as supervised child processes.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **store**: SQLite-backed job queue and per-job work logs
//! - **runtime**: Agent polling loops and VM process supervision
//! - **gateway**: Submission and query facade
//! - **observability**: Tracing and logging setup
//! - **utils**: Configuration and error types

// Public module exports
pub mod gateway;
pub mod observability;
pub mod runtime;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use gateway::RequestService;
pub use runtime::agent_pool::{AgentPool, PoolStatus};
pub use runtime::supervisor::VmSupervisor;
pub use store::{Job, JobStatus, JobStore, LogEntry, LogType};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
