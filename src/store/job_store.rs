// src/store/job_store.rs
//! SQLite-backed job store
//!
//! Jobs live in a `jobs` table; work logs live in a single `work_logs`
//! table keyed by job id, with a per-job sequence id assigned by the store
//! on append. The connection sits behind an async mutex, so a read-then-
//! write on a single row is never torn even with several agents plus the
//! gateway sharing one store.

use crate::store::models::{Job, JobStats, JobStatus, LogEntry, LogType};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Durable record of jobs and their append-only log streams
pub struct JobStore {
    db: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open (or create) the store at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| EngineError::StorageFailed(format!("failed to open database: {}", e)))?;

        let store = Self {
            db: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;

        info!("job store opened at {}", path.as_ref().display());
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                vm_name TEXT NOT NULL,
                commands TEXT NOT NULL,
                timeout_secs INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'acknowledged', 'running', 'hold', 'cancelled', 'done')),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

            CREATE TABLE IF NOT EXISTS work_logs (
                job_id TEXT NOT NULL,
                sequence_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                output TEXT NOT NULL,
                log_type TEXT NOT NULL
                    CHECK (log_type IN ('boot', 'command', 'stdout', 'stderr')),
                PRIMARY KEY (job_id, sequence_id)
            );
            "#,
        )
        .map_err(|e| EngineError::StorageFailed(format!("schema creation failed: {}", e)))?;

        Ok(())
    }

    /// Insert a new job row
    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        let db = self.db.lock().await;

        db.execute(
            r#"
            INSERT INTO jobs (id, vm_name, commands, timeout_secs, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                job.id,
                job.vm_name,
                job.commands,
                job.timeout_secs as i64,
                job.status.as_str(),
                job.created_at,
                job.updated_at,
            ],
        )
        .map_err(|e| EngineError::StorageFailed(format!("failed to insert job: {}", e)))?;

        Ok(())
    }

    /// Fetch a job by exact id
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let db = self.db.lock().await;

        let mut stmt = db
            .prepare("SELECT * FROM jobs WHERE id = ?1")
            .map_err(|e| EngineError::StorageFailed(format!("query preparation failed: {}", e)))?;

        let mut rows = stmt
            .query_map(params![id], row_to_job)
            .map_err(|e| EngineError::StorageFailed(format!("query execution failed: {}", e)))?;

        match rows.next() {
            Some(row) => row
                .map(Some)
                .map_err(|e| EngineError::StorageFailed(format!("row decode failed: {}", e))),
            None => Ok(None),
        }
    }

    /// Resolve an id that may be a unique prefix to the full id
    pub async fn resolve_id(&self, id_or_prefix: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;

        let pattern = format!("{}%", id_or_prefix);
        let mut stmt = db
            .prepare("SELECT id FROM jobs WHERE id = ?1 OR id LIKE ?2 LIMIT 1")
            .map_err(|e| EngineError::StorageFailed(format!("query preparation failed: {}", e)))?;

        let mut rows = stmt
            .query_map(params![id_or_prefix, pattern], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::StorageFailed(format!("query execution failed: {}", e)))?;

        match rows.next() {
            Some(row) => row
                .map(Some)
                .map_err(|e| EngineError::StorageFailed(format!("row decode failed: {}", e))),
            None => Ok(None),
        }
    }

    /// List jobs, oldest first, optionally filtered by status
    ///
    /// Oldest-first ordering gives the claim phase FIFO fairness.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let db = self.db.lock().await;

        let collect = |stmt: &mut rusqlite::Statement<'_>,
                       args: &[&dyn rusqlite::ToSql]|
         -> Result<Vec<Job>> {
            let jobs = stmt
                .query_map(args, row_to_job)
                .map_err(|e| EngineError::StorageFailed(format!("query execution failed: {}", e)))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| EngineError::StorageFailed(format!("row decode failed: {}", e)))?;
            Ok(jobs)
        };

        match status {
            Some(status) => {
                let mut stmt = db
                    .prepare("SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC")
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query preparation failed: {}", e))
                    })?;
                collect(&mut stmt, &[&status.as_str()])
            }
            None => {
                let mut stmt = db
                    .prepare("SELECT * FROM jobs ORDER BY created_at ASC")
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query preparation failed: {}", e))
                    })?;
                collect(&mut stmt, &[])
            }
        }
    }

    /// List the most recent jobs, newest first, for inspection tools
    pub async fn list_recent(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let db = self.db.lock().await;

        let mut jobs = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = db
                    .prepare(
                        "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                    )
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query preparation failed: {}", e))
                    })?;
                let rows = stmt
                    .query_map(params![status.as_str(), limit as i64], row_to_job)
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query execution failed: {}", e))
                    })?;
                for row in rows {
                    jobs.push(row.map_err(|e| {
                        EngineError::StorageFailed(format!("row decode failed: {}", e))
                    })?);
                }
            }
            None => {
                let mut stmt = db
                    .prepare("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?1")
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query preparation failed: {}", e))
                    })?;
                let rows = stmt.query_map(params![limit as i64], row_to_job).map_err(|e| {
                    EngineError::StorageFailed(format!("query execution failed: {}", e))
                })?;
                for row in rows {
                    jobs.push(row.map_err(|e| {
                        EngineError::StorageFailed(format!("row decode failed: {}", e))
                    })?);
                }
            }
        }

        Ok(jobs)
    }

    /// Set a job's status unconditionally, bumping `updated_at`
    pub async fn update_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let db = self.db.lock().await;

        let changed = db
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now(), id],
            )
            .map_err(|e| EngineError::StorageFailed(format!("failed to update status: {}", e)))?;

        if changed == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Conditionally move a job from one status to another
    ///
    /// Returns whether the transition was applied. A `false` return means
    /// the job was not in `from` anymore; with several agents polling, this
    /// is how exactly one of them claims a pending job.
    pub async fn transition(&self, id: &str, from: JobStatus, to: JobStatus) -> Result<bool> {
        let db = self.db.lock().await;

        let changed = db
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), Utc::now(), id, from.as_str()],
            )
            .map_err(|e| EngineError::StorageFailed(format!("failed to transition job: {}", e)))?;

        Ok(changed == 1)
    }

    /// Cancel a job unless it already reached a terminal state
    ///
    /// Returns whether the status actually changed. A finished job stays
    /// `done`; cancelling twice is a no-op.
    pub async fn mark_cancelled(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;

        let changed = db
            .execute(
                r#"
                UPDATE jobs SET status = 'cancelled', updated_at = ?1
                WHERE id = ?2 AND status NOT IN ('done', 'cancelled')
                "#,
                params![Utc::now(), id],
            )
            .map_err(|e| EngineError::StorageFailed(format!("failed to cancel job: {}", e)))?;

        if changed == 1 {
            return Ok(true);
        }

        // Distinguish "already terminal" from "no such job"
        let exists: bool = db
            .query_row("SELECT COUNT(*) FROM jobs WHERE id = ?1", params![id], |row| {
                row.get::<_, i64>(0).map(|n| n > 0)
            })
            .map_err(|e| EngineError::StorageFailed(format!("query execution failed: {}", e)))?;

        if exists {
            Ok(false)
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }

    /// Append one line to a job's work log
    ///
    /// The sequence id is assigned inside the insert itself, so appends from
    /// concurrent tasks never race for the same slot.
    pub async fn append_log(&self, job_id: &str, log_type: LogType, output: &str) -> Result<i64> {
        let db = self.db.lock().await;

        db.execute(
            r#"
            INSERT INTO work_logs (job_id, sequence_id, timestamp, output, log_type)
            VALUES (
                ?1,
                (SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM work_logs WHERE job_id = ?1),
                ?2, ?3, ?4
            )
            "#,
            params![job_id, Utc::now(), output, log_type.as_str()],
        )
        .map_err(|e| EngineError::StorageFailed(format!("failed to append log: {}", e)))?;

        let seq: i64 = db
            .query_row(
                "SELECT MAX(sequence_id) FROM work_logs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::StorageFailed(format!("query execution failed: {}", e)))?;

        Ok(seq)
    }

    /// Page through a job's log, newest first
    pub async fn list_logs(
        &self,
        job_id: &str,
        limit: usize,
        offset: usize,
        log_type: Option<LogType>,
    ) -> Result<Vec<LogEntry>> {
        let db = self.db.lock().await;

        let mut entries = Vec::new();
        match log_type {
            Some(ty) => {
                let mut stmt = db
                    .prepare(
                        r#"
                        SELECT sequence_id, timestamp, output, log_type FROM work_logs
                        WHERE job_id = ?1 AND log_type = ?2
                        ORDER BY sequence_id DESC LIMIT ?3 OFFSET ?4
                        "#,
                    )
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query preparation failed: {}", e))
                    })?;
                let rows = stmt
                    .query_map(
                        params![job_id, ty.as_str(), limit as i64, offset as i64],
                        row_to_log_entry,
                    )
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query execution failed: {}", e))
                    })?;
                for row in rows {
                    entries.push(row.map_err(|e| {
                        EngineError::StorageFailed(format!("row decode failed: {}", e))
                    })?);
                }
            }
            None => {
                let mut stmt = db
                    .prepare(
                        r#"
                        SELECT sequence_id, timestamp, output, log_type FROM work_logs
                        WHERE job_id = ?1
                        ORDER BY sequence_id DESC LIMIT ?2 OFFSET ?3
                        "#,
                    )
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query preparation failed: {}", e))
                    })?;
                let rows = stmt
                    .query_map(params![job_id, limit as i64, offset as i64], row_to_log_entry)
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query execution failed: {}", e))
                    })?;
                for row in rows {
                    entries.push(row.map_err(|e| {
                        EngineError::StorageFailed(format!("row decode failed: {}", e))
                    })?);
                }
            }
        }

        Ok(entries)
    }

    /// Read log entries with `sequence_id > after`, oldest first
    ///
    /// This is the tailing primitive: follow mode restarts from the last
    /// sequence id it has seen.
    pub async fn logs_after(
        &self,
        job_id: &str,
        after: i64,
        log_type: Option<LogType>,
    ) -> Result<Vec<LogEntry>> {
        let db = self.db.lock().await;

        let mut entries = Vec::new();
        match log_type {
            Some(ty) => {
                let mut stmt = db
                    .prepare(
                        r#"
                        SELECT sequence_id, timestamp, output, log_type FROM work_logs
                        WHERE job_id = ?1 AND sequence_id > ?2 AND log_type = ?3
                        ORDER BY sequence_id ASC
                        "#,
                    )
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query preparation failed: {}", e))
                    })?;
                let rows = stmt
                    .query_map(params![job_id, after, ty.as_str()], row_to_log_entry)
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query execution failed: {}", e))
                    })?;
                for row in rows {
                    entries.push(row.map_err(|e| {
                        EngineError::StorageFailed(format!("row decode failed: {}", e))
                    })?);
                }
            }
            None => {
                let mut stmt = db
                    .prepare(
                        r#"
                        SELECT sequence_id, timestamp, output, log_type FROM work_logs
                        WHERE job_id = ?1 AND sequence_id > ?2
                        ORDER BY sequence_id ASC
                        "#,
                    )
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query preparation failed: {}", e))
                    })?;
                let rows = stmt
                    .query_map(params![job_id, after], row_to_log_entry)
                    .map_err(|e| {
                        EngineError::StorageFailed(format!("query execution failed: {}", e))
                    })?;
                for row in rows {
                    entries.push(row.map_err(|e| {
                        EngineError::StorageFailed(format!("row decode failed: {}", e))
                    })?);
                }
            }
        }

        Ok(entries)
    }

    /// Delete a job and its entire log stream
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;

        db.execute("DELETE FROM work_logs WHERE job_id = ?1", params![id])
            .map_err(|e| EngineError::StorageFailed(format!("failed to delete logs: {}", e)))?;

        let changed = db
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .map_err(|e| EngineError::StorageFailed(format!("failed to delete job: {}", e)))?;

        if changed == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Per-status job counts
    pub async fn status_counts(&self) -> Result<BTreeMap<String, u64>> {
        let db = self.db.lock().await;

        let mut stmt = db
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .map_err(|e| EngineError::StorageFailed(format!("query preparation failed: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(|e| EngineError::StorageFailed(format!("query execution failed: {}", e)))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row
                .map_err(|e| EngineError::StorageFailed(format!("row decode failed: {}", e)))?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Number of jobs created today (UTC)
    pub async fn jobs_created_today(&self) -> Result<u64> {
        let db = self.db.lock().await;

        let count: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE substr(created_at, 1, 10) = date('now')",
                [],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::StorageFailed(format!("query execution failed: {}", e)))?;

        Ok(count as u64)
    }

    /// Aggregate statistics for the stats command
    pub async fn stats(&self) -> Result<JobStats> {
        let status_counts = self.status_counts().await?;
        let today_jobs = self.jobs_created_today().await?;
        let total_jobs = status_counts.values().sum();

        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT vm_name, COUNT(*) as count FROM jobs GROUP BY vm_name ORDER BY count DESC LIMIT 5",
            )
            .map_err(|e| EngineError::StorageFailed(format!("query preparation failed: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(|e| EngineError::StorageFailed(format!("query execution failed: {}", e)))?;

        let mut top_vm_names = Vec::new();
        for row in rows {
            top_vm_names.push(
                row.map_err(|e| EngineError::StorageFailed(format!("row decode failed: {}", e)))?,
            );
        }

        Ok(JobStats {
            total_jobs,
            today_jobs,
            status_counts,
            top_vm_names,
        })
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status_str: String = row.get("status")?;
    let status = JobStatus::from_str(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Job {
        id: row.get("id")?,
        vm_name: row.get("vm_name")?,
        commands: row.get("commands")?,
        timeout_secs: row.get::<_, i64>("timeout_secs")? as u64,
        status,
        created_at: row.get::<_, DateTime<Utc>>("created_at")?,
        updated_at: row.get::<_, DateTime<Utc>>("updated_at")?,
    })
}

fn row_to_log_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let type_str: String = row.get(3)?;
    let log_type = LogType::from_str(&type_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(LogEntry {
        sequence_id: row.get(0)?,
        timestamp: row.get::<_, DateTime<Utc>>(1)?,
        output: row.get(2)?,
        log_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_store() -> (tempfile::TempDir, JobStore) {
        let dir = tempdir().unwrap();
        let store = JobStore::open(dir.path().join("test.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_dir, store) = open_store().await;

        let job = Job::new("ubuntu-server", "echo hi", 5);
        store.insert_job(&job).await.unwrap();

        let fetched = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.vm_name, "ubuntu-server");
        assert_eq!(fetched.commands, "echo hi");
        assert_eq!(fetched.timeout_secs, 5);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_dir, store) = open_store().await;
        assert!(store.get_job("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_id_prefix() {
        let (_dir, store) = open_store().await;

        let job = Job::new("vm", "x", 5);
        store.insert_job(&job).await.unwrap();

        let resolved = store.resolve_id(&job.id[..8]).await.unwrap();
        assert_eq!(resolved, Some(job.id.clone()));
        assert!(store.resolve_id("zzzzzzzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_jobs_fifo_order() {
        let (_dir, store) = open_store().await;

        let mut first = Job::new("vm", "x", 5);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = Job::new("vm", "y", 5);
        // Insert newest first to prove ordering comes from created_at
        store.insert_job(&second).await.unwrap();
        store.insert_job(&first).await.unwrap();

        let pending = store.list_jobs(Some(JobStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);
    }

    #[tokio::test]
    async fn test_update_status_bumps_updated_at() {
        let (_dir, store) = open_store().await;

        let job = Job::new("vm", "x", 5);
        store.insert_job(&job).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        store
            .update_status(&job.id, JobStatus::Acknowledged)
            .await
            .unwrap();
        let fetched = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Acknowledged);
        assert!(fetched.updated_at >= fetched.created_at);
    }

    #[tokio::test]
    async fn test_update_status_missing_is_not_found() {
        let (_dir, store) = open_store().await;
        let err = store.update_status("nope", JobStatus::Done).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_transition_claims_exactly_once() {
        let (_dir, store) = open_store().await;

        let job = Job::new("vm", "x", 5);
        store.insert_job(&job).await.unwrap();

        let first = store
            .transition(&job.id, JobStatus::Pending, JobStatus::Acknowledged)
            .await
            .unwrap();
        let second = store
            .transition(&job.id, JobStatus::Pending, JobStatus::Acknowledged)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_mark_cancelled_guards_terminal_states() {
        let (_dir, store) = open_store().await;

        let job = Job::new("vm", "x", 5);
        store.insert_job(&job).await.unwrap();

        assert!(store.mark_cancelled(&job.id).await.unwrap());
        // Second cancel is a no-op
        assert!(!store.mark_cancelled(&job.id).await.unwrap());

        let done = Job::new("vm", "y", 5);
        store.insert_job(&done).await.unwrap();
        store.update_status(&done.id, JobStatus::Done).await.unwrap();
        assert!(!store.mark_cancelled(&done.id).await.unwrap());
        let fetched = store.get_job(&done.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_mark_cancelled_missing_is_not_found() {
        let (_dir, store) = open_store().await;
        assert!(store.mark_cancelled("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_log_sequence_monotonic_no_gaps() {
        let (_dir, store) = open_store().await;

        let job = Job::new("vm", "x", 5);
        store.insert_job(&job).await.unwrap();

        for i in 0..5 {
            let seq = store
                .append_log(&job.id, LogType::Stdout, &format!("line {}", i))
                .await
                .unwrap();
            assert_eq!(seq, i + 1);
        }

        let logs = store.logs_after(&job.id, 0, None).await.unwrap();
        let seqs: Vec<i64> = logs.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        // Reading twice returns identical sequences
        let again = store.logs_after(&job.id, 0, None).await.unwrap();
        let outputs: Vec<_> = logs.iter().map(|e| &e.output).collect();
        let outputs_again: Vec<_> = again.iter().map(|e| &e.output).collect();
        assert_eq!(outputs, outputs_again);
    }

    #[tokio::test]
    async fn test_sequences_are_per_job() {
        let (_dir, store) = open_store().await;

        let a = Job::new("vm", "x", 5);
        let b = Job::new("vm", "y", 5);
        store.insert_job(&a).await.unwrap();
        store.insert_job(&b).await.unwrap();

        assert_eq!(store.append_log(&a.id, LogType::Boot, "a1").await.unwrap(), 1);
        assert_eq!(store.append_log(&b.id, LogType::Boot, "b1").await.unwrap(), 1);
        assert_eq!(store.append_log(&a.id, LogType::Boot, "a2").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_logs_newest_first_with_filter() {
        let (_dir, store) = open_store().await;

        let job = Job::new("vm", "x", 5);
        store.insert_job(&job).await.unwrap();
        store.append_log(&job.id, LogType::Boot, "booting").await.unwrap();
        store.append_log(&job.id, LogType::Stdout, "hello").await.unwrap();
        store.append_log(&job.id, LogType::Stderr, "oops").await.unwrap();

        let all = store.list_logs(&job.id, 10, 0, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].output, "oops");

        let stderr_only = store
            .list_logs(&job.id, 10, 0, Some(LogType::Stderr))
            .await
            .unwrap();
        assert_eq!(stderr_only.len(), 1);
        assert_eq!(stderr_only[0].output, "oops");

        let paged = store.list_logs(&job.id, 1, 1, None).await.unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].output, "hello");
    }

    #[tokio::test]
    async fn test_logs_after_restartable() {
        let (_dir, store) = open_store().await;

        let job = Job::new("vm", "x", 5);
        store.insert_job(&job).await.unwrap();
        for i in 0..4 {
            store
                .append_log(&job.id, LogType::Stdout, &format!("l{}", i))
                .await
                .unwrap();
        }

        let tail = store.logs_after(&job.id, 2, None).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence_id, 3);
        assert_eq!(tail[1].sequence_id, 4);
    }

    #[tokio::test]
    async fn test_delete_job_drops_logs() {
        let (_dir, store) = open_store().await;

        let job = Job::new("vm", "x", 5);
        store.insert_job(&job).await.unwrap();
        store.append_log(&job.id, LogType::Boot, "hi").await.unwrap();

        store.delete_job(&job.id).await.unwrap();
        assert!(store.get_job(&job.id).await.unwrap().is_none());
        assert!(store.logs_after(&job.id, 0, None).await.unwrap().is_empty());
        assert!(store.delete_job(&job.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, store) = open_store().await;

        let a = Job::new("ubuntu", "x", 5);
        let b = Job::new("ubuntu", "y", 5);
        let c = Job::new("debian", "z", 5);
        for job in [&a, &b, &c] {
            store.insert_job(job).await.unwrap();
        }
        store.update_status(&a.id, JobStatus::Done).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.today_jobs, 3);
        assert_eq!(stats.status_counts.get("pending"), Some(&2));
        assert_eq!(stats.status_counts.get("done"), Some(&1));
        assert_eq!(stats.top_vm_names[0], ("ubuntu".to_string(), 2));
    }
}
