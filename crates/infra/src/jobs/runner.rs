//! Command execution.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use queuectl_core::Outcome;

/// Captured result of running one command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionOutput {
    /// `None` when the process never started, was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecutionOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    fn spawn_failed(err: std::io::Error) -> Self {
        Self {
            stderr: format!("failed to start: {err}"),
            ..Self::default()
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self {
            stderr: format!("timed out after {}s", after.as_secs_f64()),
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Map to the retry policy's input. Anything but exit status zero is a failure.
    pub fn outcome(&self) -> Outcome {
        if self.success() {
            return Outcome::Succeeded;
        }
        let reason = match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None if self.timed_out => self.stderr.clone(),
            None if self.stderr.starts_with("failed to start") => self.stderr.clone(),
            None => "terminated by signal".to_string(),
        };
        Outcome::failed(reason)
    }
}

/// Runs a job's command line.
///
/// Implementations never fail: every problem is reported through the returned
/// [`ExecutionOutput`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> ExecutionOutput;
}

/// Runs commands through the platform shell (`sh -c`, or `cmd /C` on Windows).
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    timeout: Option<Duration>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the child and report a failure once `timeout` elapses. Zero disables
    /// the limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    fn shell_command(command: &str) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> ExecutionOutput {
        let mut cmd = Self::shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return ExecutionOutput::spawn_failed(err),
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => return ExecutionOutput::timed_out(limit),
            },
            None => wait.await,
        };

        match output {
            Ok(output) => ExecutionOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            },
            Err(err) => ExecutionOutput::spawn_failed(err),
        }
    }
}

/// Deterministic runner for tests: commands starting with `ok` succeed, anything
/// else exits 1, after an optional delay.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedRunner {
    delay: Duration,
    calls: std::sync::atomic::AtomicUsize,
    started: tokio::sync::Notify,
}

#[cfg(test)]
impl ScriptedRunner {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once a command has started.
    pub(crate) async fn started(&self) {
        self.started.notified().await;
    }
}

#[cfg(test)]
#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> ExecutionOutput {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.started.notify_one();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if command.starts_with("ok") {
            ExecutionOutput::exited(0)
        } else {
            ExecutionOutput::exited(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reasons() {
        assert!(ExecutionOutput::exited(0).outcome().is_success());
        assert_eq!(ExecutionOutput::exited(3).outcome(), Outcome::failed("exit code 3"));
        assert_eq!(
            ExecutionOutput::default().outcome(),
            Outcome::failed("terminated by signal")
        );
        assert_eq!(
            ExecutionOutput::timed_out(Duration::from_secs(2)).outcome(),
            Outcome::failed("timed out after 2s")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_runner_reports_exit_codes_and_output() {
        let runner = ShellRunner::new();

        let ok = runner.run("echo hello").await;
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = runner.run("echo oops >&2; exit 4").await;
        assert_eq!(failed.exit_code, Some(4));
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_runner_kills_on_timeout() {
        let runner = ShellRunner::new().with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();

        let output = runner.run("sleep 5").await;

        assert!(output.timed_out);
        assert!(!output.outcome().is_success());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_timeout_does_not_kill_commands() {
        let runner = ShellRunner::new().with_timeout(Duration::ZERO);
        assert_eq!(runner.timeout, None);

        let output = runner.run("sleep 0.1; exit 0").await;
        assert!(output.success());
        assert!(!output.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unknown_command_is_a_failure_not_a_panic() {
        let output = ShellRunner::new().run("definitely-not-a-real-binary-xyz").await;
        assert!(!output.success());
        assert_eq!(output.exit_code, Some(127));
    }
}
