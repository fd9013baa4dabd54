use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use queuectl_cli::args::{Commands, ConfigCommand, DlqCommand, WorkerCommand};
use queuectl_cli::Cli;
use queuectl_core::{JobId, JobState};
use queuectl_observability::LogFormat;

fn parse(args: &[&str]) -> Cli {
    let mut argv = vec!["queuectl"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap()
}

#[test]
fn enqueue_uses_default_db_and_optional_retries() {
    let cli = parse(&["--db", "db/queue.db", "enqueue", "--command", "echo hi"]);
    assert_eq!(cli.db, PathBuf::from("db/queue.db"));
    match cli.command {
        Commands::Enqueue {
            command,
            max_retries,
        } => {
            assert_eq!(command, "echo hi");
            assert_eq!(max_retries, None);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let cli = parse(&["enqueue", "--command", "false", "--max-retries", "5"]);
    assert!(matches!(
        cli.command,
        Commands::Enqueue {
            max_retries: Some(5),
            ..
        }
    ));
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = parse(&["status", "--json", "--db", "/tmp/q.db", "--log-format", "json"]);
    assert_eq!(cli.db, PathBuf::from("/tmp/q.db"));
    assert_eq!(cli.log_format, LogFormat::Json);
    assert!(matches!(cli.command, Commands::Status { json: true }));
}

#[test]
fn worker_start_defaults_to_one_worker_polling_every_two_seconds() {
    let cli = parse(&["worker", "start"]);
    let Commands::Worker {
        action: WorkerCommand::Start(args),
    } = cli.command
    else {
        panic!("expected worker start");
    };

    let config = args.worker_config();
    assert_eq!(config.count, 1);
    assert_eq!(config.poll_interval, Duration::from_millis(2000));
    assert_eq!(config.lease_timeout, None);
    assert_eq!(args.command_timeout(), None);
}

#[test]
fn worker_start_flags_flow_into_config() {
    let cli = parse(&[
        "worker",
        "start",
        "--count",
        "4",
        "--poll-interval-ms",
        "250",
        "--lease-timeout-secs",
        "60",
        "--timeout-secs",
        "10",
    ]);
    let Commands::Worker {
        action: WorkerCommand::Start(args),
    } = cli.command
    else {
        panic!("expected worker start");
    };

    let config = args.worker_config();
    assert_eq!(config.count, 4);
    assert_eq!(config.poll_interval, Duration::from_millis(250));
    assert_eq!(config.lease_timeout, Some(Duration::from_secs(60)));
    assert_eq!(args.command_timeout(), Some(Duration::from_secs(10)));
}

#[test]
fn zero_lease_and_command_timeouts_are_rejected() {
    for flag in ["--lease-timeout-secs", "--timeout-secs"] {
        let err = Cli::try_parse_from(["queuectl", "worker", "start", flag, "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation, "{flag}");
    }
}

#[test]
fn worker_stop_parses() {
    let cli = parse(&["worker", "stop"]);
    assert!(matches!(
        cli.command,
        Commands::Worker {
            action: WorkerCommand::Stop
        }
    ));
}

#[test]
fn list_filters_by_known_states_only() {
    let cli = parse(&["list", "--state", "dead"]);
    assert!(matches!(
        cli.command,
        Commands::List {
            state: Some(JobState::Dead),
            json: false
        }
    ));

    let err = Cli::try_parse_from(["queuectl", "list", "--state", "sleeping"]).unwrap_err();
    assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
}

#[test]
fn dlq_retry_requires_a_valid_job_id() {
    let id = JobId::new();
    let cli = parse(&["dlq", "retry", &id.to_string()]);
    match cli.command {
        Commands::Dlq {
            action: DlqCommand::Retry { job_id },
        } => assert_eq!(job_id, id),
        other => panic!("unexpected command: {other:?}"),
    }

    assert!(Cli::try_parse_from(["queuectl", "dlq", "retry", "not-a-uuid"]).is_err());
}

#[test]
fn config_get_key_is_optional() {
    let cli = parse(&["config", "get"]);
    assert!(matches!(
        cli.command,
        Commands::Config {
            action: ConfigCommand::Get { key: None }
        }
    ));

    let cli = parse(&["config", "set", "backoff_base", "3"]);
    match cli.command {
        Commands::Config {
            action: ConfigCommand::Set { key, value },
        } => {
            assert_eq!(key, "backoff_base");
            assert_eq!(value, "3");
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn missing_subcommand_is_an_error() {
    assert!(Cli::try_parse_from(["queuectl"]).is_err());
    assert!(Cli::try_parse_from(["queuectl", "enqueue"]).is_err());
}
