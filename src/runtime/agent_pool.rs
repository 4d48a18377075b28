// src/runtime/agent_pool.rs
//! Agent pool
//!
//! Runs N independent agent loops against the same job store. There is no
//! leader election or work partitioning: every agent's claim step races
//! for the same pending jobs, and the conditional pending->acknowledged
//! transition decides who wins. Each agent owns a private supervisor, so
//! the pool's running-VM handles are disjoint by construction.

use crate::runtime::agent::{AgentService, AgentStatus};
use crate::runtime::supervisor::{RunningVmInfo, VmSupervisor};
use crate::store::JobStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Merged status of every agent in the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_agents: usize,
    pub active_agents: usize,
    pub running_vms: usize,
    pub vm_details: BTreeMap<String, RunningVmInfo>,
    pub request_counts: BTreeMap<String, u64>,
    pub today_requests: u64,
    pub agents: Vec<AgentStatus>,
}

/// Owns N agent loops sharing one job store
pub struct AgentPool {
    store: Arc<JobStore>,
    script_path: PathBuf,
    poll_interval: Duration,
    count: usize,
    agents: Mutex<Vec<Arc<AgentService>>>,
}

impl AgentPool {
    pub fn new(
        store: Arc<JobStore>,
        script_path: PathBuf,
        count: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            script_path,
            poll_interval,
            count,
            agents: Mutex::new(Vec::new()),
        }
    }

    /// Construct and start all agents
    pub async fn start_all(&self) {
        let mut agents = self.agents.lock().await;

        for i in 0..self.count {
            let supervisor = Arc::new(VmSupervisor::new(
                self.store.clone(),
                self.script_path.clone(),
            ));
            let agent = Arc::new(AgentService::new(
                i + 1,
                self.store.clone(),
                supervisor,
                self.poll_interval,
            ));
            agent.start().await;
            agents.push(agent);
            info!("started agent {}/{}", i + 1, self.count);
        }
    }

    /// Stop every agent and clear the pool
    pub async fn stop_all(&self) {
        let mut agents = self.agents.lock().await;

        for (i, agent) in agents.iter().enumerate() {
            agent.stop().await;
            info!("stopped agent {}/{}", i + 1, agents.len());
        }
        agents.clear();
    }

    /// Merge each agent's status into one report
    pub async fn combined_status(&self) -> PoolStatus {
        let agents = self.agents.lock().await;

        let mut statuses = Vec::with_capacity(agents.len());
        for agent in agents.iter() {
            statuses.push(agent.get_status().await);
        }

        let mut running_vms = 0;
        let mut vm_details = BTreeMap::new();
        let mut active_agents = 0;
        for status in &statuses {
            running_vms += status.running_vms;
            vm_details.extend(status.vm_details.clone());
            if status.running {
                active_agents += 1;
            }
        }

        // Store-wide figures are identical across agents; take the first
        let (request_counts, today_requests) = statuses
            .first()
            .map(|s| (s.request_counts.clone(), s.today_requests))
            .unwrap_or_default();

        PoolStatus {
            total_agents: statuses.len(),
            active_agents,
            running_vms,
            vm_details,
            request_counts,
            today_requests,
            agents: statuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Job, JobStatus};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::tempdir;

    async fn setup(count: usize) -> (tempfile::TempDir, Arc<JobStore>, AgentPool) {
        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("test.db")).await.unwrap());

        let script = dir.path().join("vm.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"login:\"\nread line\nread more\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let pool = AgentPool::new(store.clone(), script, count, Duration::from_millis(100));
        (dir, store, pool)
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let (_dir, _store, pool) = setup(3).await;

        pool.start_all().await;
        let status = pool.combined_status().await;
        assert_eq!(status.total_agents, 3);
        assert_eq!(status.active_agents, 3);

        pool.stop_all().await;
        let status = pool.combined_status().await;
        assert_eq!(status.total_agents, 0);
        assert_eq!(status.active_agents, 0);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_without_double_start() {
        let (_dir, store, pool) = setup(2).await;

        let mut ids = Vec::new();
        for i in 0..4 {
            let job = Job::new(format!("vm-{}", i), "echo ok", 10);
            store.insert_job(&job).await.unwrap();
            ids.push(job.id);
        }

        pool.start_all().await;

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let done = store.list_jobs(Some(JobStatus::Done)).await.unwrap();
            if done.len() == 4 {
                break;
            }
            assert!(Instant::now() < deadline, "jobs did not all complete");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        pool.stop_all().await;

        // Every job booted exactly once across the whole pool
        for id in &ids {
            let lines: Vec<String> = store
                .logs_after(id, 0, None)
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.output)
                .collect();
            let starts = lines
                .iter()
                .filter(|l| l.starts_with("Starting VM:"))
                .count();
            assert_eq!(starts, 1, "job {} started {} times", id, starts);
        }
    }

    #[tokio::test]
    async fn test_combined_status_merges_vm_details() {
        let (_dir, store, pool) = setup(2).await;

        let job = Job::new("vm-slow", "noop", 60);
        store.insert_job(&job).await.unwrap();

        pool.start_all().await;

        // The script stays alive until command injection finishes, which
        // leaves a comfortable window to observe it as running.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = pool.combined_status().await;
            if status.running_vms == 1 && status.vm_details.contains_key(&job.id) {
                break;
            }
            assert!(Instant::now() < deadline, "VM never showed up in status");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        pool.stop_all().await;
    }
}
