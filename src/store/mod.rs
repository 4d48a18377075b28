// src/store/mod.rs
//! Durable job store
//!
//! This module provides the persistent record of jobs and their append-only
//! work logs:
//!
//! - **models**: `Job`, `JobStatus`, `LogType`, `LogEntry` and report types
//! - **job_store**: SQLite-backed `JobStore` with atomic claim semantics
//!
//! One `JobStore` instance is constructed at process startup and shared as
//! `Arc<JobStore>` by every component that needs it; there is no global
//! singleton.

pub mod job_store;
pub mod models;

pub use job_store::JobStore;
pub use models::{Job, JobStats, JobStatus, LogEntry, LogType};
