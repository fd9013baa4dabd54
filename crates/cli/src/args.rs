//! Command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use queuectl_core::{JobId, JobState};
use queuectl_infra::jobs::WorkerConfig;
use queuectl_observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "queuectl")]
#[command(about = "Persistent background job queue for shell commands")]
#[command(version)]
pub struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "QUEUECTL_DB", default_value = "db/queue.db")]
    pub db: PathBuf,

    /// Log format: json or pretty
    #[arg(long, global = true, env = "QUEUECTL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Add a new job to the queue
    Enqueue {
        /// Shell command to execute
        #[arg(long)]
        command: String,

        /// Maximum attempts before the job is dead-lettered (default: config max_retries)
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Manage workers
    Worker {
        #[command(subcommand)]
        action: WorkerCommand,
    },

    /// Show job counts per state and active workers
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List jobs, newest first
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Dead letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqCommand,
    },

    /// Manage queue configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Print a job's full record as JSON
    Inspect { job_id: JobId },
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Run workers in the foreground until Ctrl+C or `worker stop`
    Start(WorkerStartArgs),
    /// Ask all running workers to stop after their current job
    Stop,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerStartArgs {
    /// Number of concurrent workers
    #[arg(long, default_value_t = 1)]
    pub count: usize,

    /// Idle wait between polls, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// Return jobs held longer than this to pending (off by default).
    /// Must exceed the longest expected command run.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub lease_timeout_secs: Option<u64>,

    /// Kill commands running longer than this (off by default)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_secs: Option<u64>,
}

impl WorkerStartArgs {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_count(self.count)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_lease_timeout(self.lease_timeout_secs.map(Duration::from_secs))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// List dead-lettered jobs
    List,
    /// Move a dead job back to pending
    Retry { job_id: JobId },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show one key, or every known key
    Get { key: Option<String> },
    /// Set a key (max_retries, backoff_base)
    Set { key: String, value: String },
}
