// src/runtime/supervisor.rs
//! VM process supervisor
//!
//! Runs exactly one VM child process per job end-to-end and emits an
//! ordered work log of everything that happened: boot banner lines,
//! boot-completion detection, command injection, raw stdout/stderr, idle
//! timeouts, and exit interpretation.
//!
//! The supervisor owns the Running VM Handle map. A handle exists only
//! while the child process is alive; its removal is the completion signal
//! the agent loop polls for. No internal fault escapes the supervisor
//! unlogged: spawn and I/O failures become `stderr` work-log lines.

use crate::store::{JobStore, LogType};
use crate::utils::errors::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Case-insensitive substrings that mark the guest as booted
const BOOT_INDICATORS: [&str; 10] = [
    "login:",
    "welcome to",
    "$ ",
    "# ",
    "root@",
    "user@",
    "ubuntu",
    "debian",
    "centos",
    "started",
];

/// Pause after boot detection so the guest shell prompt can settle
const BOOT_SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Pause between the command blob and the trailing `exit`
const EXIT_DELAY: Duration = Duration::from_millis(500);
/// Idle watchdog poll interval
const WATCHDOG_TICK: Duration = Duration::from_secs(1);
/// Grace window between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Bounded join on the output readers after process exit
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// In-memory handle for one live VM process
struct RunningVm {
    vm_name: String,
    started_at: Instant,
    pid: Option<u32>,
}

/// Observability view of one running VM
#[derive(Debug, Clone, Serialize)]
pub struct RunningVmInfo {
    pub vm_name: String,
    pub running_secs: u64,
}

/// Supervises the VM child processes of one agent
pub struct VmSupervisor {
    store: Arc<JobStore>,
    script_path: PathBuf,
    running: Arc<DashMap<String, RunningVm>>,
}

impl VmSupervisor {
    pub fn new(store: Arc<JobStore>, script_path: PathBuf) -> Self {
        Self {
            store,
            script_path,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Start the VM process for a job
    ///
    /// Fails with `AlreadyRunning` if a handle already exists for this job;
    /// the check-and-insert goes through the map's entry API so two starts
    /// cannot race past each other. On success the process has been spawned
    /// and all further work (output capture, boot detection, watchdog, exit
    /// handling) happens on background tasks.
    pub async fn start(
        &self,
        job_id: &str,
        vm_name: &str,
        commands: &str,
        timeout_secs: u64,
    ) -> Result<()> {
        match self.running.entry(job_id.to_string()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyRunning(job_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(RunningVm {
                    vm_name: vm_name.to_string(),
                    started_at: Instant::now(),
                    pid: None,
                });
            }
        }

        log_line(
            &self.store,
            job_id,
            LogType::Boot,
            &format!("Starting VM: {}", vm_name),
        )
        .await;

        let mut child = match Command::new(&self.script_path)
            .arg(vm_name)
            .arg(timeout_secs.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                log_line(
                    &self.store,
                    job_id,
                    LogType::Stderr,
                    &format!("Error running VM: {}", e),
                )
                .await;
                self.running.remove(job_id);
                return Err(EngineError::ProcessSpawnFailed(e.to_string()));
            }
        };

        let pid = child.id();
        if let Some(mut handle) = self.running.get_mut(job_id) {
            handle.pid = pid;
        }
        debug!("job {}: VM process spawned (pid {:?})", job_id, pid);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let last_output = Arc::new(parking_lot::Mutex::new(Instant::now()));
        let boot_detected = Arc::new(AtomicBool::new(false));
        let stdin_slot = Arc::new(Mutex::new(stdin));

        let stdout_task = stdout.map(|out| {
            tokio::spawn(pump_stdout(
                out,
                self.store.clone(),
                job_id.to_string(),
                commands.to_string(),
                last_output.clone(),
                boot_detected,
                stdin_slot,
            ))
        });
        let stderr_task = stderr.map(|err| {
            tokio::spawn(pump_stderr(
                err,
                self.store.clone(),
                job_id.to_string(),
                last_output.clone(),
            ))
        });

        tokio::spawn(watchdog(
            self.running.clone(),
            self.store.clone(),
            job_id.to_string(),
            Duration::from_secs(timeout_secs),
            last_output,
            pid,
        ));

        let running = self.running.clone();
        let store = self.store.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let result = child.wait().await;

            if let Some(task) = stdout_task {
                let _ = tokio::time::timeout(READER_JOIN_TIMEOUT, task).await;
            }
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(READER_JOIN_TIMEOUT, task).await;
            }

            match result {
                Ok(status) => match status.code() {
                    Some(0) => {
                        log_line(
                            &store,
                            &job_id,
                            LogType::Stdout,
                            "VM execution completed successfully",
                        )
                        .await
                    }
                    Some(124) => {
                        log_line(
                            &store,
                            &job_id,
                            LogType::Stderr,
                            &format!("VM execution timed out after {} seconds", timeout_secs),
                        )
                        .await
                    }
                    code => {
                        log_line(
                            &store,
                            &job_id,
                            LogType::Stderr,
                            &format!(
                                "VM execution failed with exit code: {}",
                                code.unwrap_or(-1)
                            ),
                        )
                        .await
                    }
                },
                Err(e) => {
                    log_line(
                        &store,
                        &job_id,
                        LogType::Stderr,
                        &format!("Error running VM: {}", e),
                    )
                    .await
                }
            }

            // Handle removal is the completion signal the agent loop polls for
            running.remove(&job_id);
            debug!("job {}: VM process reaped", job_id);
        });

        Ok(())
    }

    /// Stop a job's VM process: SIGTERM, grace window, SIGKILL
    ///
    /// Returns `false` when no handle exists (benign no-op). Idempotent.
    pub async fn stop(&self, job_id: &str) -> bool {
        let pid = match self.running.get(job_id) {
            Some(handle) => handle.pid,
            None => return false,
        };

        if let Some(pid) = pid {
            terminate_process(pid).await;
        }
        self.running.remove(job_id);
        true
    }

    /// Whether a VM process is currently alive for this job
    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.contains_key(job_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Snapshot of all live VMs with elapsed wall-clock time
    pub fn list_running(&self) -> BTreeMap<String, RunningVmInfo> {
        self.running
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    RunningVmInfo {
                        vm_name: entry.value().vm_name.clone(),
                        running_secs: entry.value().started_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Heuristic: does this stdout line indicate the guest finished booting?
fn is_boot_complete(line: &str) -> bool {
    let lower = line.to_lowercase();
    BOOT_INDICATORS.iter().any(|ind| lower.contains(ind))
}

/// Append a work-log line, never letting a store error escape the task
async fn log_line(store: &JobStore, job_id: &str, log_type: LogType, output: &str) {
    if let Err(e) = store.append_log(job_id, log_type, output).await {
        warn!("job {}: failed to append {} log: {}", job_id, log_type, e);
    }
}

/// Capture stdout lines; the first boot-indicator line triggers one-shot
/// command injection.
async fn pump_stdout(
    stdout: ChildStdout,
    store: Arc<JobStore>,
    job_id: String,
    commands: String,
    last_output: Arc<parking_lot::Mutex<Instant>>,
    boot_detected: Arc<AtomicBool>,
    stdin_slot: Arc<Mutex<Option<ChildStdin>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                *last_output.lock() = Instant::now();
                log_line(&store, &job_id, LogType::Stdout, line).await;

                if is_boot_complete(line) && !boot_detected.swap(true, Ordering::SeqCst) {
                    log_line(&store, &job_id, LogType::Boot, "Boot process completed").await;
                    tokio::time::sleep(BOOT_SETTLE_DELAY).await;
                    send_commands(&store, &job_id, &commands, &stdin_slot).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log_line(
                    &store,
                    &job_id,
                    LogType::Stderr,
                    &format!("Error reading VM output: {}", e),
                )
                .await;
                break;
            }
        }
    }
}

/// Capture stderr lines
async fn pump_stderr(
    stderr: ChildStderr,
    store: Arc<JobStore>,
    job_id: String,
    last_output: Arc<parking_lot::Mutex<Instant>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                *last_output.lock() = Instant::now();
                log_line(&store, &job_id, LogType::Stderr, line).await;
            }
            Ok(None) => break,
            Err(e) => {
                log_line(
                    &store,
                    &job_id,
                    LogType::Stderr,
                    &format!("Error reading VM output: {}", e),
                )
                .await;
                break;
            }
        }
    }
}

/// Write the command blob, then `exit`, then close the guest's stdin
///
/// Takes the stdin handle out of its slot, so the injection can fire at
/// most once per job no matter how many lines match the boot heuristic.
async fn send_commands(
    store: &JobStore,
    job_id: &str,
    commands: &str,
    stdin_slot: &Mutex<Option<ChildStdin>>,
) {
    log_line(
        store,
        job_id,
        LogType::Command,
        &format!("Sending commands: {}", commands),
    )
    .await;

    let Some(mut stdin) = stdin_slot.lock().await.take() else {
        return;
    };

    let result: std::io::Result<()> = async {
        stdin.write_all(commands.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        tokio::time::sleep(EXIT_DELAY).await;
        stdin.write_all(b"exit\n").await?;
        stdin.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        log_line(
            store,
            job_id,
            LogType::Stderr,
            &format!("Error sending commands: {}", e),
        )
        .await;
    }
    // stdin drops here, closing the guest's input stream
}

/// Terminate a VM whose output has gone quiet for longer than its timeout
///
/// Measures idle gaps, not total runtime: a VM producing steady output
/// never trips this. Exits once the job's handle is gone.
async fn watchdog(
    running: Arc<DashMap<String, RunningVm>>,
    store: Arc<JobStore>,
    job_id: String,
    timeout: Duration,
    last_output: Arc<parking_lot::Mutex<Instant>>,
    pid: Option<u32>,
) {
    loop {
        tokio::time::sleep(WATCHDOG_TICK).await;
        if !running.contains_key(&job_id) {
            break;
        }

        let idle = last_output.lock().elapsed();
        if idle > timeout {
            log_line(
                &store,
                &job_id,
                LogType::Stderr,
                &format!(
                    "No output detected for {} seconds, terminating VM",
                    timeout.as_secs()
                ),
            )
            .await;
            if let Some(pid) = pid {
                terminate_process(pid).await;
            }
            break;
        }
    }
}

/// SIGTERM, wait the grace window, SIGKILL if still alive
async fn terminate_process(pid: u32) {
    let pid = Pid::from_raw(pid as i32);

    debug!("sending SIGTERM to pid {}", pid);
    let _ = kill(pid, Signal::SIGTERM);

    tokio::time::sleep(KILL_GRACE).await;

    if kill(pid, None).is_ok() {
        debug!("process still alive, sending SIGKILL to pid {}", pid);
        let _ = kill(pid, Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Job, JobStore};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("vm.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn setup(script_body: &str) -> (tempfile::TempDir, Arc<JobStore>, VmSupervisor) {
        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("test.db")).await.unwrap());
        let script = write_script(dir.path(), script_body);
        let supervisor = VmSupervisor::new(store.clone(), script);
        (dir, store, supervisor)
    }

    async fn insert_job(store: &JobStore, timeout_secs: u64) -> Job {
        let job = Job::new("test-vm", "echo hi", timeout_secs);
        store.insert_job(&job).await.unwrap();
        job
    }

    async fn wait_until_stopped(supervisor: &VmSupervisor, job_id: &str, deadline: Duration) {
        let start = Instant::now();
        while supervisor.is_running(job_id) {
            assert!(start.elapsed() < deadline, "VM did not stop within deadline");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn outputs(store: &JobStore, job_id: &str) -> Vec<String> {
        store
            .logs_after(job_id, 0, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.output)
            .collect()
    }

    #[test]
    fn test_boot_indicators_case_insensitive() {
        assert!(is_boot_complete("ubuntu-server login: "));
        assert!(is_boot_complete("Welcome to Debian"));
        assert!(is_boot_complete("root@host:~#"));
        assert!(is_boot_complete("[  OK  ] Started Network Service"));
        assert!(!is_boot_complete("loading kernel modules"));
    }

    #[tokio::test]
    async fn test_boot_detection_fires_once() {
        let script = r#"
echo "login:"
echo "login:"
while read line; do
  if [ "$line" = "exit" ]; then exit 0; fi
  echo "$line"
done
"#;
        let (_dir, store, supervisor) = setup(script).await;
        let job = insert_job(&store, 30).await;

        supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap();
        wait_until_stopped(&supervisor, &job.id, Duration::from_secs(10)).await;

        let lines = outputs(&store, &job.id).await;
        let boots = lines.iter().filter(|l| *l == "Boot process completed").count();
        let injections = lines
            .iter()
            .filter(|l| l.starts_with("Sending commands:"))
            .count();
        assert_eq!(boots, 1);
        assert_eq!(injections, 1);
        assert!(lines.contains(&"VM execution completed successfully".to_string()));
    }

    #[tokio::test]
    async fn test_log_sequence_matches_protocol_order() {
        let script = r#"
echo "login:"
while read line; do
  if [ "$line" = "exit" ]; then exit 0; fi
  echo "$line"
done
"#;
        let (_dir, store, supervisor) = setup(script).await;
        let job = insert_job(&store, 30).await;

        supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap();
        wait_until_stopped(&supervisor, &job.id, Duration::from_secs(10)).await;

        let lines = outputs(&store, &job.id).await;
        let position = |needle: &str| {
            lines
                .iter()
                .position(|l| l.contains(needle))
                .unwrap_or_else(|| panic!("missing log line: {}", needle))
        };

        let starting = position("Starting VM: test-vm");
        let login = position("login:");
        let booted = position("Boot process completed");
        let sending = position("Sending commands: echo hi");
        let echoed = lines.iter().rposition(|l| l == "echo hi").unwrap();
        let success = position("VM execution completed successfully");

        assert!(starting < login);
        assert!(login < booted);
        assert!(booted < sending);
        assert!(sending < echoed);
        assert!(echoed < success);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (_dir, store, supervisor) = setup("sleep 30").await;
        let job = insert_job(&store, 60).await;

        supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap();
        let err = supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));

        assert!(supervisor.stop(&job.id).await);
    }

    #[tokio::test]
    async fn test_stop_unknown_is_benign() {
        let (_dir, _store, supervisor) = setup("sleep 1").await;
        assert!(!supervisor.stop("no-such-job").await);
    }

    #[tokio::test]
    async fn test_idle_timeout_terminates_vm() {
        let script = r#"
echo "still warming up"
sleep 30
"#;
        let (_dir, store, supervisor) = setup(script).await;
        let job = insert_job(&store, 1).await;

        supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap();
        wait_until_stopped(&supervisor, &job.id, Duration::from_secs(10)).await;

        let lines = outputs(&store, &job.id).await;
        assert!(lines
            .iter()
            .any(|l| l.contains("No output detected for 1 seconds, terminating VM")));
        assert!(lines.iter().any(|l| l.contains("VM execution failed")));
    }

    #[tokio::test]
    async fn test_timeout_exit_code_124() {
        let (_dir, store, supervisor) = setup("exit 124").await;
        let job = insert_job(&store, 7).await;

        supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap();
        wait_until_stopped(&supervisor, &job.id, Duration::from_secs(10)).await;

        let lines = outputs(&store, &job.id).await;
        assert!(lines
            .iter()
            .any(|l| l == "VM execution timed out after 7 seconds"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_logged() {
        let (_dir, store, supervisor) = setup("exit 3").await;
        let job = insert_job(&store, 30).await;

        supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap();
        wait_until_stopped(&supervisor, &job.id, Duration::from_secs(10)).await;

        let lines = outputs(&store, &job.id).await;
        assert!(lines
            .iter()
            .any(|l| l == "VM execution failed with exit code: 3"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_logged_and_unregistered() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path().join("test.db")).await.unwrap());
        let supervisor =
            VmSupervisor::new(store.clone(), dir.path().join("does-not-exist.sh"));
        let job = insert_job(&store, 5).await;

        let err = supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProcessSpawnFailed(_)));
        assert!(!supervisor.is_running(&job.id));

        let lines = outputs(&store, &job.id).await;
        assert!(lines.iter().any(|l| l.starts_with("Error running VM:")));
    }

    #[tokio::test]
    async fn test_list_running_reports_elapsed() {
        let (_dir, store, supervisor) = setup("sleep 30").await;
        let job = insert_job(&store, 60).await;

        supervisor
            .start(&job.id, &job.vm_name, &job.commands, job.timeout_secs)
            .await
            .unwrap();

        let vms = supervisor.list_running();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms.get(&job.id).unwrap().vm_name, "test-vm");
        assert_eq!(supervisor.running_count(), 1);

        assert!(supervisor.stop(&job.id).await);
        assert!(!supervisor.is_running(&job.id));
        // Idempotent: second stop reports not found
        assert!(!supervisor.stop(&job.id).await);
    }
}
