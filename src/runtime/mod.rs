// src/runtime/mod.rs
//! Job execution runtime
//!
//! The runtime is the engine's core: it turns pending jobs into supervised
//! VM child processes and durable work logs.
//!
//! - **supervisor**: one VM child process per job: spawn, boot detection,
//!   command injection, idle-timeout watchdog, exit interpretation
//! - **agent**: one polling worker claiming pending jobs and reconciling
//!   running ones
//! - **agent_pool**: N agents racing over the same store
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     AgentPool (N)                      │
//! │  ┌─────────────┐  ┌─────────────┐                      │
//! │  │ AgentService │  │ AgentService │  ...               │
//! │  │  Supervisor  │  │  Supervisor  │                    │
//! │  └──────┬───────┘  └──────┬───────┘                    │
//! │         │ claim / reconcile │                          │
//! │         └─────────┬─────────┘                          │
//! │                   ▼                                    │
//! │              JobStore (SQLite)                         │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Each supervisor fans out per-job work onto background tasks: a reader
//! per output stream, an idle watchdog, and a process waiter. Agents only
//! ever learn about process exit by polling the supervisor's handle map.

pub mod agent;
pub mod agent_pool;
pub mod supervisor;

pub use agent::{AgentService, AgentStatus};
pub use agent_pool::{AgentPool, PoolStatus};
pub use supervisor::{RunningVmInfo, VmSupervisor};
