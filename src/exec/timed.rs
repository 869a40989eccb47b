//! Wall-clock bounded subprocess execution.
//!
//! The child runs in its own process group. When the deadline elapses the group
//! receives SIGINT; if it is still alive after the grace period it receives
//! SIGKILL. Either way the outcome is [`ExecOutcome::Timeout`], which callers
//! treat as an expected signal to checkpoint and stop, not as a failure.

use super::{CommandRunner, CommandSpec, ExecOutcome, TIMEOUT_EXIT_CODE};
use crate::errors::ExecError;
use crate::ui::{RunUI, format_duration};
use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{info, warn};

/// Default wait between the deadline interrupt and the forced kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5 * 60);

/// Default interval between progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct TimedExecutor {
    grace: Duration,
    progress_interval: Duration,
    ui: Option<Arc<RunUI>>,
}

impl Default for TimedExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE, DEFAULT_PROGRESS_INTERVAL)
    }
}

impl TimedExecutor {
    pub fn new(grace: Duration, progress_interval: Duration) -> Self {
        Self {
            grace,
            progress_interval: progress_interval.max(Duration::from_secs(1)),
            ui: None,
        }
    }

    pub fn with_ui(mut self, ui: Arc<RunUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    /// Run `spec` to completion, or until `deadline` elapses.
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        deadline: Option<Duration>,
    ) -> Result<ExecOutcome, ExecError> {
        let label = spec.display();
        let mut child = Command::new(&spec.cmd)
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::SpawnFailed {
                program: spec.cmd.clone(),
                source,
            })?;

        let started = Instant::now();
        let deadline_at = deadline.and_then(|d| started.checked_add(d));
        info!(
            command = %label,
            pid = child.id().unwrap_or(0),
            budget = %deadline.map(format_duration).unwrap_or_else(|| "unbounded".into()),
            "Command started"
        );
        if let Some(ref ui) = self.ui {
            ui.start_step(&label);
        }

        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|source| ExecError::WaitFailed {
                        program: spec.cmd.clone(),
                        source,
                    })?;
                    let outcome = classify(status);
                    info!(
                        command = %label,
                        elapsed = %format_duration(started.elapsed()),
                        %outcome,
                        "Command finished"
                    );
                    if let Some(ref ui) = self.ui {
                        ui.finish_step(&label, outcome.is_success());
                    }
                    return Ok(outcome);
                }
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    let remaining = deadline_at.map(|at| at.saturating_duration_since(Instant::now()));
                    info!(
                        command = %label,
                        elapsed = %format_duration(elapsed),
                        remaining = %remaining.map(format_duration).unwrap_or_else(|| "unbounded".into()),
                        "Command still running"
                    );
                    if let Some(ref ui) = self.ui {
                        ui.update_step(&label, elapsed, remaining);
                    }
                }
                _ = wait_for(deadline_at) => break,
            }
        }

        let budget = deadline.unwrap_or_default();
        warn!(
            command = %label,
            budget = %format_duration(budget),
            grace = %format_duration(self.grace),
            "Deadline exceeded, interrupting command"
        );
        self.stop(&mut child, &label).await?;
        if let Some(ref ui) = self.ui {
            ui.step_timed_out(&label, budget);
        }
        Ok(ExecOutcome::Timeout)
    }

    /// SIGINT the group, then SIGKILL it once the grace period runs out.
    async fn stop(&self, child: &mut Child, label: &str) -> Result<(), ExecError> {
        let pgid = child.id().map(|pid| pid as i32);
        if let Some(pgid) = pgid {
            signal_group(pgid, Signal::SIGINT)?;
        }

        match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(command = %label, ?status, "Command exited after interrupt");
                Ok(())
            }
            Ok(Err(source)) => Err(ExecError::WaitFailed {
                program: label.to_string(),
                source,
            }),
            Err(_) => {
                warn!(
                    command = %label,
                    grace = %format_duration(self.grace),
                    "Command ignored interrupt, killing process group"
                );
                if let Some(pgid) = pgid {
                    signal_group(pgid, Signal::SIGKILL)?;
                }
                child.wait().await.map_err(|source| ExecError::WaitFailed {
                    program: label.to_string(),
                    source,
                })?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CommandRunner for TimedExecutor {
    async fn run(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        deadline: Option<Duration>,
    ) -> Result<ExecOutcome, ExecError> {
        self.execute(spec, cwd, deadline).await
    }
}

async fn wait_for(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn signal_group(pgid: i32, signal: Signal) -> Result<(), ExecError> {
    match killpg(Pid::from_raw(pgid), signal) {
        // Group already gone
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(source) => Err(ExecError::SignalFailed { pgid, source }),
    }
}

/// Map an exit status onto an outcome. Exit code 124 keeps its reserved meaning.
pub fn classify(status: ExitStatus) -> ExecOutcome {
    match status.code() {
        Some(0) => ExecOutcome::Success,
        Some(TIMEOUT_EXIT_CODE) => ExecOutcome::Timeout,
        Some(code) => ExecOutcome::Failure(code),
        None => ExecOutcome::Failure(128 + status.signal().unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", &["-c", script])
    }

    fn executor(grace_ms: u64) -> TimedExecutor {
        TimedExecutor::new(Duration::from_millis(grace_ms), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_zero_exit_is_success() {
        let dir = tempdir().unwrap();
        let outcome = executor(100)
            .execute(&sh("exit 0"), dir.path(), None)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Success);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure_with_code() {
        let dir = tempdir().unwrap();
        let outcome = executor(100)
            .execute(&sh("exit 3"), dir.path(), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Failure(3));
    }

    #[tokio::test]
    async fn test_reserved_exit_code_is_timeout() {
        let dir = tempdir().unwrap();
        let outcome = executor(100)
            .execute(&sh("exit 124"), dir.path(), None)
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_deadline_interrupts_long_command() {
        let dir = tempdir().unwrap();
        let started = std::time::Instant::now();
        let outcome = executor(2_000)
            .execute(&sh("sleep 30"), dir.path(), Some(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_ignored_interrupt_escalates_to_kill() {
        let dir = tempdir().unwrap();
        let started = std::time::Instant::now();
        let outcome = executor(300)
            .execute(
                &sh("trap '' INT; sleep 30"),
                dir.path(),
                Some(Duration::from_millis(300)),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_runs_in_requested_directory_with_env() {
        let dir = tempdir().unwrap();
        let mut spec = sh("printf '%s' \"$BATON_TEST_VALUE\" > marker.txt");
        spec.env.insert("BATON_TEST_VALUE".into(), "hello".into());
        let outcome = executor(100).execute(&spec, dir.path(), None).await.unwrap();
        assert_eq!(outcome, ExecOutcome::Success);
        let written = std::fs::read_to_string(dir.path().join("marker.txt")).unwrap();
        assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempdir().unwrap();
        let spec = CommandSpec::new("baton-definitely-not-a-real-program", &[]);
        let err = executor(100).execute(&spec, dir.path(), None).await.unwrap_err();
        assert!(matches!(err, ExecError::SpawnFailed { .. }));
    }

    #[test]
    fn test_classify_signal_death_is_failure() {
        let status = ExitStatus::from_raw(9);
        assert_eq!(classify(status), ExecOutcome::Failure(137));
    }
}
