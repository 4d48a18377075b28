// src/main.rs
//! VM Simulation Engine
//!
//! Queue VM execution jobs, run them through a pool of polling agents, and
//! inspect their captured output.

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vmsim_engine::observability::init_tracing;
use vmsim_engine::store::{JobStatus, JobStore, LogEntry, LogType};
use vmsim_engine::{AgentPool, EngineConfig, RequestService};

/// How often the agents command prints a pool status summary
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "vmsim", version, about = "VM simulation job engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent pool until interrupted
    Agents,

    /// Submit a new job
    Submit {
        /// VM image/boot profile name
        vm_name: String,

        /// Command blob injected once the VM boots
        commands: String,

        /// Idle-timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// List recent jobs
    List {
        /// Only show jobs with this status
        #[arg(short, long)]
        status: Option<JobStatus>,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one job by id or id prefix
    Show { id: String },

    /// Show a job's work log
    Logs {
        id: String,

        /// Maximum number of entries to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Only show entries of this type
        #[arg(long)]
        log_type: Option<LogType>,

        /// Keep tailing new entries
        #[arg(short, long)]
        follow: bool,
    },

    /// Print store-wide statistics
    Stats,

    /// Cancel a job
    Cancel { id: String },

    /// Delete a job and its work log
    Delete {
        id: String,

        /// Skip the confirmation check
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let config = EngineConfig::load()?;

    match cli.command {
        Command::Agents => run_agents(config).await,
        Command::Config => {
            println!("{:#?}", config);
            let problems = config.validate();
            if problems.is_empty() {
                println!("configuration is valid");
            } else {
                for problem in &problems {
                    eprintln!("invalid: {}", problem);
                }
                std::process::exit(1);
            }
            Ok(())
        }
        command => {
            let store = Arc::new(JobStore::open(&config.database.path).await?);
            let service = RequestService::new(
                store,
                config.vm.default_timeout_secs,
                config.vm.max_timeout_secs,
            );
            run_query(command, service).await
        }
    }
}

/// Run the agent pool until ctrl-c
async fn run_agents(config: EngineConfig) -> Result<()> {
    info!("Starting VM simulation engine v{}", env!("CARGO_PKG_VERSION"));

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("invalid configuration: {}", problem);
        }
        anyhow::bail!("refusing to start with invalid configuration");
    }

    let store = Arc::new(JobStore::open(&config.database.path).await?);
    let pool = Arc::new(AgentPool::new(
        store,
        config.vm.script_path.clone(),
        config.agent.count,
        Duration::from_secs(config.agent.poll_interval_secs),
    ));

    info!("Initializing agent pool with {} agents", config.agent.count);
    pool.start_all().await;

    let mut report = tokio::time::interval(STATUS_REPORT_INTERVAL);
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
            _ = report.tick() => {
                let status = pool.combined_status().await;
                info!(
                    "pool status: {}/{} agents active, {} VMs running, {} requests today",
                    status.active_agents,
                    status.total_agents,
                    status.running_vms,
                    status.today_requests,
                );
            }
        }
    }

    pool.stop_all().await;
    info!("Engine stopped gracefully");
    Ok(())
}

/// Dispatch a one-shot query/submission command
async fn run_query(command: Command, service: RequestService) -> Result<()> {
    match command {
        Command::Submit {
            vm_name,
            commands,
            timeout,
        } => {
            let job = service.submit(&vm_name, &commands, timeout).await?;
            println!("submitted job {}", job.id);
            println!("  vm:      {}", job.vm_name);
            println!("  timeout: {}s", job.timeout_secs);
        }
        Command::List { status, limit } => {
            let jobs = service.list_recent(status, limit).await?;
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            println!(
                "{:<28} {:<14} {:<20} {}",
                "ID", "STATUS", "VM", "CREATED"
            );
            for job in jobs {
                println!(
                    "{:<28} {:<14} {:<20} {}",
                    job.id,
                    job.status,
                    job.vm_name,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Command::Show { id } => {
            let job = service.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Logs {
            id,
            limit,
            log_type,
            follow,
        } => {
            if follow {
                let stream = service.follow(&id, 0, log_type).await?;
                futures::pin_mut!(stream);
                while let Some(entry) = stream.next().await {
                    print_log_entry(&entry?);
                }
            } else {
                // Stored newest-first; flip for natural reading order
                let mut entries = service.logs(&id, limit, 0, log_type).await?;
                entries.reverse();
                for entry in &entries {
                    print_log_entry(entry);
                }
            }
        }
        Command::Stats => {
            let stats = service.stats().await?;
            println!("total jobs:  {}", stats.total_jobs);
            println!("today:       {}", stats.today_jobs);
            println!("by status:");
            for (status, count) in &stats.status_counts {
                println!("  {:<14} {}", status, count);
            }
            if !stats.top_vm_names.is_empty() {
                println!("top VMs:");
                for (name, count) in &stats.top_vm_names {
                    println!("  {:<20} {}", name, count);
                }
            }
        }
        Command::Cancel { id } => {
            let job = service.cancel(&id).await?;
            println!("job {} is now {}", job.id, job.status);
        }
        Command::Delete { id, yes } => {
            if !yes {
                anyhow::bail!("refusing to delete without --yes");
            }
            let deleted = service.delete(&id).await?;
            println!("deleted job {}", deleted);
        }
        Command::Agents | Command::Config => unreachable!("handled in main"),
    }
    Ok(())
}

fn print_log_entry(entry: &LogEntry) {
    println!(
        "[{}] {:>6} {:<8} {}",
        entry.timestamp.format("%H:%M:%S"),
        entry.sequence_id,
        entry.log_type,
        entry.output,
    );
}
