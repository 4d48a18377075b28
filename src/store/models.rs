// src/store/models.rs
//! Data model: jobs and work-log entries

use crate::utils::errors::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

/// Lifecycle state of a job
///
/// Jobs move forward along `pending -> acknowledged -> running -> done`.
/// `cancelled` is reachable from any non-terminal state. `hold` is a parked
/// state reserved for manual use; the engine never transitions into or out
/// of it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Acknowledged,
    Running,
    Hold,
    Cancelled,
    Done,
}

impl JobStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Acknowledged,
        JobStatus::Running,
        JobStatus::Hold,
        JobStatus::Cancelled,
        JobStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Acknowledged => "acknowledged",
            JobStatus::Running => "running",
            JobStatus::Hold => "hold",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Done => "done",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "acknowledged" => Ok(JobStatus::Acknowledged),
            "running" => Ok(JobStatus::Running),
            "hold" => Ok(JobStatus::Hold),
            "cancelled" => Ok(JobStatus::Cancelled),
            "done" => Ok(JobStatus::Done),
            other => Err(EngineError::InvalidRequest(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// Classification of one work-log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Boot,
    Command,
    Stdout,
    Stderr,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Boot => "boot",
            LogType::Command => "command",
            LogType::Stdout => "stdout",
            LogType::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boot" => Ok(LogType::Boot),
            "command" => Ok(LogType::Command),
            "stdout" => Ok(LogType::Stdout),
            "stderr" => Ok(LogType::Stderr),
            other => Err(EngineError::InvalidRequest(format!(
                "unknown log type: {}",
                other
            ))),
        }
    }
}

/// One VM-execution request and its lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque unique identifier, generated at creation
    pub id: String,

    /// Which VM image/boot profile to run
    pub vm_name: String,

    /// Raw command blob sent to the VM's stdin once boot is detected
    pub commands: String,

    /// Idle-timeout in seconds; also passed to the boot script
    pub timeout_secs: u64,

    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job with a fresh time-sortable id
    pub fn new(vm_name: impl Into<String>, commands: impl Into<String>, timeout_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new().to_string(),
            vm_name: vm_name.into(),
            commands: commands.into(),
            timeout_secs,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One line of a job's append-only work log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Store-assigned, monotonically increasing per job
    pub sequence_id: i64,
    pub timestamp: DateTime<Utc>,
    pub output: String,
    pub log_type: LogType,
}

/// Store-wide statistics for reporting
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub total_jobs: u64,
    pub today_jobs: u64,
    pub status_counts: BTreeMap<String, u64>,
    /// Most-requested VM names, descending, at most five
    pub top_vm_names: Vec<(String, u64)>,
}
