// src/runtime/agent.rs
//! Polling agent worker
//!
//! One `AgentService` repeatedly claims pending jobs, hands them to its
//! private supervisor, and reconciles running jobs whose VM process has
//! exited. Completion detection is deliberately polling-based: the store
//! and the supervisor stay decoupled, and a restarted agent picks up
//! `running` jobs where the last one left off.

use crate::runtime::supervisor::{RunningVmInfo, VmSupervisor};
use crate::store::{JobStatus, JobStore};
use crate::utils::errors::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Bounded wait for the in-flight poll iteration on shutdown
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only snapshot of one agent, for observability
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: usize,
    pub running: bool,
    pub poll_interval_secs: u64,
    pub running_vms: usize,
    pub vm_details: BTreeMap<String, RunningVmInfo>,
    pub request_counts: BTreeMap<String, u64>,
    pub today_requests: u64,
}

/// One independent polling worker
pub struct AgentService {
    id: usize,
    store: Arc<JobStore>,
    supervisor: Arc<VmSupervisor>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentService {
    pub fn new(
        id: usize,
        store: Arc<JobStore>,
        supervisor: Arc<VmSupervisor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            store,
            supervisor,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            loop_task: Mutex::new(None),
        }
    }

    /// Start the background polling loop; no-op if already running
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let id = self.id;
        let store = self.store.clone();
        let supervisor = self.supervisor.clone();
        let running = self.running.clone();
        let poll_interval = self.poll_interval;

        let task = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                if let Err(e) = process_pending(&store, &supervisor).await {
                    warn!("agent {}: error processing pending jobs: {}", id, e);
                } else if let Err(e) = reconcile_running(&store, &supervisor).await {
                    warn!("agent {}: error reconciling running jobs: {}", id, e);
                }
                tokio::time::sleep(poll_interval).await;
            }
        });
        *self.loop_task.lock().await = Some(task);

        info!(
            "agent {} started with {}s poll interval",
            self.id,
            self.poll_interval.as_secs()
        );
    }

    /// Stop the polling loop, waiting (bounded) for the current iteration
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(mut task) = self.loop_task.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("agent {}: poll loop did not finish in time, aborting", self.id);
                task.abort();
            }
        }
        info!("agent {} stopped", self.id);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the job's VM (best effort) and mark it cancelled
    ///
    /// Safe to call at any lifecycle point; a job already in a terminal
    /// state is left untouched.
    pub async fn cancel_request(&self, job_id: &str) -> Result<()> {
        let stopped = self.supervisor.stop(job_id).await;
        if stopped {
            info!("agent {}: stopped VM for job {}", self.id, job_id);
        }

        let changed = self.store.mark_cancelled(job_id).await?;
        if changed {
            info!("agent {}: job {} cancelled", self.id, job_id);
        }
        Ok(())
    }

    /// Observability snapshot; store errors degrade to empty counts
    pub async fn get_status(&self) -> AgentStatus {
        let vm_details = self.supervisor.list_running();

        let request_counts = match self.store.status_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("agent {}: error reading status counts: {}", self.id, e);
                BTreeMap::new()
            }
        };
        let today_requests = match self.store.jobs_created_today().await {
            Ok(count) => count,
            Err(e) => {
                warn!("agent {}: error reading today's request count: {}", self.id, e);
                0
            }
        };

        AgentStatus {
            agent_id: self.id,
            running: self.is_running(),
            poll_interval_secs: self.poll_interval.as_secs(),
            running_vms: vm_details.len(),
            vm_details,
            request_counts,
            today_requests,
        }
    }
}

/// Claim pending jobs oldest-first and start their VMs
///
/// Each candidate is handled independently: a job whose claim is lost to a
/// sibling agent is skipped, and a job whose VM fails to start is cancelled
/// without aborting the rest of the batch.
async fn process_pending(store: &JobStore, supervisor: &VmSupervisor) -> Result<()> {
    let pending = store.list_jobs(Some(JobStatus::Pending)).await?;

    for job in pending {
        let claimed = store
            .transition(&job.id, JobStatus::Pending, JobStatus::Acknowledged)
            .await?;
        if !claimed {
            continue; // another agent won the race
        }

        info!("processing job {}: vm={}", job.id, job.vm_name);

        match supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
        {
            Ok(()) => {
                store.update_status(&job.id, JobStatus::Running).await?;
                info!("started VM for job {}", job.id);
            }
            Err(e) => {
                warn!("failed to start VM for job {}: {}", job.id, e);
                if let Err(e) = store.update_status(&job.id, JobStatus::Cancelled).await {
                    warn!("failed to cancel job {}: {}", job.id, e);
                }
            }
        }
    }

    Ok(())
}

/// Flip jobs whose VM process has exited from `running` to `done`
async fn reconcile_running(store: &JobStore, supervisor: &VmSupervisor) -> Result<()> {
    let running = store.list_jobs(Some(JobStatus::Running)).await?;

    for job in running {
        if !supervisor.is_running(&job.id) {
            store.update_status(&job.id, JobStatus::Done).await?;
            info!("job {} completed", job.id);
        }
    }

    Ok(())
}
