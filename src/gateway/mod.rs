// src/gateway/mod.rs
//! Request gateway facade
//!
//! The surface an HTTP layer or CLI calls into: submit, query, tail, and
//! cancel jobs. Everything here is a thin translation onto `JobStore`
//! operations; no VM state lives at this layer.

use crate::store::{Job, JobStats, JobStatus, JobStore, LogEntry, LogType};
use crate::utils::errors::{EngineError, Result};
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Poll interval for follow-mode log tailing
const FOLLOW_POLL: Duration = Duration::from_secs(1);

/// Submission and query facade over the job store
pub struct RequestService {
    store: Arc<JobStore>,
    default_timeout_secs: u64,
    max_timeout_secs: u64,
}

impl RequestService {
    pub fn new(store: Arc<JobStore>, default_timeout_secs: u64, max_timeout_secs: u64) -> Self {
        Self {
            store,
            default_timeout_secs,
            max_timeout_secs,
        }
    }

    /// Create a new pending job
    ///
    /// A missing timeout falls back to the configured default; an explicit
    /// timeout must be at least 1 and is clamped to the configured maximum.
    pub async fn submit(
        &self,
        vm_name: &str,
        commands: &str,
        timeout_secs: Option<u64>,
    ) -> Result<Job> {
        if vm_name.trim().is_empty() {
            return Err(EngineError::InvalidRequest("vm_name must not be empty".into()));
        }

        let timeout_secs = timeout_secs.unwrap_or(self.default_timeout_secs);
        if timeout_secs < 1 {
            return Err(EngineError::InvalidRequest(
                "timeout must be at least 1 second".into(),
            ));
        }
        let timeout_secs = timeout_secs.min(self.max_timeout_secs);

        let job = Job::new(vm_name, commands, timeout_secs);
        self.store.insert_job(&job).await?;

        info!("job {} submitted: vm={}", job.id, job.vm_name);
        Ok(job)
    }

    /// Fetch a job by id or unique id prefix
    pub async fn get(&self, id_or_prefix: &str) -> Result<Job> {
        let id = self.resolve(id_or_prefix).await?;
        self.store
            .get_job(&id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id_or_prefix.to_string()))
    }

    /// List jobs oldest-first, optionally filtered by status
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.store.list_jobs(status).await
    }

    /// List the most recent jobs, newest first
    pub async fn list_recent(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        self.store.list_recent(status, limit).await
    }

    /// Page through a job's work log, newest first
    pub async fn logs(
        &self,
        id_or_prefix: &str,
        limit: usize,
        offset: usize,
        log_type: Option<LogType>,
    ) -> Result<Vec<LogEntry>> {
        let id = self.resolve(id_or_prefix).await?;
        self.store.list_logs(&id, limit, offset, log_type).await
    }

    /// Unbounded lazy stream over a job's log, restartable from `after`
    ///
    /// Yields existing entries immediately, then polls for new ones; the
    /// stream never ends on its own, mirroring `tail -f`.
    pub async fn follow(
        &self,
        id_or_prefix: &str,
        after: i64,
        log_type: Option<LogType>,
    ) -> Result<impl Stream<Item = Result<LogEntry>>> {
        let id = self.resolve(id_or_prefix).await?;
        Ok(follow_logs(self.store.clone(), id, after, log_type))
    }

    /// Cancel a job; terminal jobs are left untouched
    pub async fn cancel(&self, id_or_prefix: &str) -> Result<Job> {
        let id = self.resolve(id_or_prefix).await?;
        let changed = self.store.mark_cancelled(&id).await?;
        if changed {
            info!("job {} cancelled", id);
        }
        self.store
            .get_job(&id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id))
    }

    /// Store-wide job statistics
    pub async fn stats(&self) -> Result<JobStats> {
        self.store.stats().await
    }

    /// Delete a job and its work log
    pub async fn delete(&self, id_or_prefix: &str) -> Result<String> {
        let id = self.resolve(id_or_prefix).await?;
        self.store.delete_job(&id).await?;
        info!("job {} deleted", id);
        Ok(id)
    }

    async fn resolve(&self, id_or_prefix: &str) -> Result<String> {
        self.store
            .resolve_id(id_or_prefix)
            .await?
            .ok_or_else(|| EngineError::NotFound(id_or_prefix.to_string()))
    }
}

/// Tail a job's log as an unbounded async stream
fn follow_logs(
    store: Arc<JobStore>,
    job_id: String,
    after: i64,
    log_type: Option<LogType>,
) -> impl Stream<Item = Result<LogEntry>> {
    let state = (store, job_id, after, VecDeque::<LogEntry>::new());

    futures::stream::try_unfold(state, move |(store, job_id, mut last, mut buffer)| async move {
        loop {
            if let Some(entry) = buffer.pop_front() {
                last = entry.sequence_id;
                return Ok(Some((entry, (store, job_id, last, buffer))));
            }

            let batch = store.logs_after(&job_id, last, log_type).await?;
            if batch.is_empty() {
                tokio::time::sleep(FOLLOW_POLL).await;
            } else {
                buffer.extend(batch);
            }
        }
    })
}
