//! Subcommand handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use queuectl_core::{ConfigKey, JobState};
use queuectl_infra::jobs::{JobQueue, QueueError, ShellRunner, SqliteJobStore, WorkerPool};

use crate::args::{Cli, Commands, ConfigCommand, DlqCommand, WorkerCommand, WorkerStartArgs};
use crate::output;

type Queue = JobQueue<SqliteJobStore>;

/// Open the database named on the command line and run the subcommand.
pub async fn run(cli: Cli) -> Result<()> {
    let store = SqliteJobStore::open(&cli.db)
        .await
        .with_context(|| format!("failed to open queue database at {}", cli.db.display()))?;
    let queue = JobQueue::open(store)
        .await
        .context("failed to initialize queue database")?;

    match cli.command {
        Commands::Enqueue {
            command,
            max_retries,
        } => {
            let id = queue.enqueue(&command, max_retries).await?;
            println!("Enqueued job {id}");
        }
        Commands::Worker { action } => match action {
            WorkerCommand::Start(args) => start_workers(queue, &args).await?,
            WorkerCommand::Stop => {
                queue.request_worker_stop().await?;
                println!("Stop requested; workers exit after their current job");
            }
        },
        Commands::Status { json } => status(&queue, json).await?,
        Commands::List { state, json } => list(&queue, state, json).await?,
        Commands::Dlq { action } => match action {
            DlqCommand::List => {
                let jobs = queue.list_by_state(Some(JobState::Dead)).await?;
                if jobs.is_empty() {
                    println!("DLQ is empty");
                } else {
                    print!("{}", output::dlq_table(&jobs));
                }
            }
            DlqCommand::Retry { job_id } => {
                let job = queue.retry_from_dlq(job_id).await?;
                println!(
                    "Moved job {} back to pending (attempts so far: {})",
                    job.id, job.attempts
                );
            }
        },
        Commands::Config { action } => config(&queue, action).await?,
        Commands::Inspect { job_id } => {
            let job = queue.get_job(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }

    Ok(())
}

async fn start_workers(queue: Queue, args: &WorkerStartArgs) -> Result<()> {
    let runner = match args.command_timeout() {
        Some(limit) => ShellRunner::new().with_timeout(limit),
        None => ShellRunner::new(),
    };

    let handle = WorkerPool::spawn(Arc::new(queue), Arc::new(runner), args.worker_config());
    let ids: Vec<&str> = handle.worker_ids().iter().map(|w| w.as_str()).collect();
    println!("Started {} worker(s): {}", ids.len(), ids.join(", "));

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, finishing in-flight jobs");
            cancel.cancel();
        }
    });

    let stats = handle.join().await;
    println!(
        "Workers stopped: {} processed ({} completed, {} retried, {} dead-lettered)",
        stats.processed, stats.completed, stats.retried, stats.dead_lettered
    );
    Ok(())
}

async fn status(queue: &Queue, as_json: bool) -> Result<()> {
    let summary = queue.summary().await?;
    let workers = queue.active_workers().await?;

    if as_json {
        let value = json!({
            "jobs": summary,
            "total": summary.total(),
            "active_workers": workers,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", output::status(&summary, &workers));
    }
    Ok(())
}

async fn list(queue: &Queue, state: Option<JobState>, as_json: bool) -> Result<()> {
    let jobs = queue.list_by_state(state).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
    } else if jobs.is_empty() {
        match state {
            Some(state) => println!("No jobs found with state \"{state}\"."),
            None => println!("No jobs found."),
        }
    } else {
        print!("{}", output::jobs_table(&jobs));
    }
    Ok(())
}

async fn config(queue: &Queue, action: ConfigCommand) -> Result<()> {
    match action {
        ConfigCommand::Get { key: Some(key) } => {
            let key: ConfigKey = key.parse().map_err(QueueError::from)?;
            match queue.get_config(key.as_str()).await? {
                Some(value) => println!("{key} = {value}"),
                None => println!("{key} is not set (default {})", key.default_value()),
            }
        }
        ConfigCommand::Get { key: None } => {
            for (key, value) in queue.all_config().await? {
                match value {
                    Some(value) => println!("{key} = {value}"),
                    None => println!("{key} = {} (default)", key.default_value()),
                }
            }
        }
        ConfigCommand::Set { key, value } => {
            queue.set_config(&key, &value).await?;
            println!("Config updated: {key} = {}", value.trim());
        }
    }
    Ok(())
}
