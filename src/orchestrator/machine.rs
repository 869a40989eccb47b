//! Stage State Machine.
//!
//! `Init → Build → Package → Done`, linear. A stage advances only when its
//! handler reports `Success`; every other outcome leaves the marker untouched
//! so the same stage is retried by the next invocation. `Build` is the only
//! stage run under a deadline, and `Done` additionally requires the package
//! output to exist.

use super::state::{RunState, Stage, StageMarker};
use crate::budget::BudgetLimits;
use crate::config::Config;
use crate::errors::InvocationError;
use crate::exec::{CommandRunner, CommandSpec, ExecOutcome};
use crate::ui::{RunUI, format_duration};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// The commands behind each stage.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub project_dir: PathBuf,
    pub init: Vec<CommandSpec>,
    pub build: CommandSpec,
    pub package: Vec<CommandSpec>,
    /// Must exist after `Package` for the run to reach `Done`
    pub package_output: PathBuf,
}

impl StagePlan {
    pub fn from_config(config: &Config) -> Result<Self, InvocationError> {
        let stages = &config.toml.stages;
        let build = stages.build.command.clone().ok_or_else(|| {
            InvocationError::Configuration("stages.build.command is required".to_string())
        })?;
        Ok(Self {
            project_dir: config.project_dir.clone(),
            init: stages.init.commands.clone(),
            build,
            package: stages.package.commands.clone(),
            package_output: config.package_output(),
        })
    }
}

/// Why a run stopped short of `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The Build deadline elapsed
    Timeout,
    /// A command exited nonzero
    Failure(i32),
    /// A command could not be run, or the marker could not be advanced
    Error(String),
    /// Package succeeded but its output is missing
    VerificationFailed(PathBuf),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Timeout => write!(f, "deadline exceeded"),
            StopReason::Failure(code) => write!(f, "exit code {}", code),
            StopReason::Error(msg) => write!(f, "{}", msg),
            StopReason::VerificationFailed(path) => {
                write!(f, "package output {} missing", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineOutcome {
    Done,
    Stopped { stage: Stage, reason: StopReason },
}

impl MachineOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, MachineOutcome::Done)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            MachineOutcome::Stopped {
                reason: StopReason::Timeout,
                ..
            }
        )
    }
}

/// Result of a single stage handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Advanced { from: Stage, to: Stage },
    Stopped(StopReason),
}

pub struct StageMachine {
    plan: StagePlan,
    runner: Arc<dyn CommandRunner>,
    marker: StageMarker,
    limits: BudgetLimits,
    ui: Option<Arc<RunUI>>,
}

impl StageMachine {
    pub fn new(
        plan: StagePlan,
        runner: Arc<dyn CommandRunner>,
        marker: StageMarker,
        limits: BudgetLimits,
    ) -> Self {
        Self {
            plan,
            runner,
            marker,
            limits,
            ui: None,
        }
    }

    pub fn with_ui(mut self, ui: Arc<RunUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    /// Drive stages forward from `state.stage` until one does not succeed or
    /// the run reaches `Done`.
    pub async fn run(&self, state: &mut RunState) -> MachineOutcome {
        loop {
            if state.stage.is_terminal() {
                return MachineOutcome::Done;
            }
            let stage = state.stage;
            if let Some(ref ui) = self.ui {
                ui.start_stage(stage.index() as u64, &stage.to_string());
            }
            match self.step(state).await {
                StepResult::Advanced { from, to } => {
                    info!(stage = %from, next = %to, version = %state.version, "Stage succeeded");
                    if let Some(ref ui) = self.ui {
                        ui.stage_complete(&from.to_string());
                    }
                }
                StepResult::Stopped(reason) => {
                    warn!(stage = %stage, %reason, "Stage did not complete, stage not advanced");
                    if let Some(ref ui) = self.ui {
                        ui.stage_stopped(&stage.to_string(), &reason.to_string());
                    }
                    return MachineOutcome::Stopped { stage, reason };
                }
            }
        }
    }

    /// Run the handler of the current stage once, advancing on success.
    pub async fn step(&self, state: &mut RunState) -> StepResult {
        let from = state.stage;
        let outcome = match from {
            Stage::Init => self.run_all(&self.plan.init).await,
            Stage::Build => self.run_build(state).await,
            Stage::Package => match self.run_all(&self.plan.package).await {
                Ok(ExecOutcome::Success) => self.verify_package(),
                other => other,
            },
            Stage::Done => Ok(ExecOutcome::Success),
        };

        let reason = match outcome {
            Ok(ExecOutcome::Success) => return self.advance(state),
            Ok(ExecOutcome::Timeout) => StopReason::Timeout,
            Ok(ExecOutcome::Failure(code)) => StopReason::Failure(code),
            Err(reason) => reason,
        };
        StepResult::Stopped(reason)
    }

    fn advance(&self, state: &mut RunState) -> StepResult {
        let from = state.stage;
        let to = from.next();
        if !to.is_terminal()
            && let Err(e) = self.marker.write(to)
        {
            error!(stage = %from, error = %e, "Failed to persist stage marker");
            return StepResult::Stopped(StopReason::Error(format!(
                "failed to persist stage marker: {:#}",
                e
            )));
        }
        state.stage = to;
        StepResult::Advanced { from, to }
    }

    async fn run_build(&self, state: &RunState) -> Result<ExecOutcome, StopReason> {
        let elapsed = state.elapsed();
        let budget = self.limits.remaining(elapsed);
        info!(
            elapsed = %format_duration(elapsed),
            budget = %format_duration(budget),
            "Starting bounded build"
        );
        self.run_one(&self.plan.build, Some(budget)).await
    }

    /// Run commands in order without a deadline, stopping at the first non-success.
    async fn run_all(&self, commands: &[CommandSpec]) -> Result<ExecOutcome, StopReason> {
        for spec in commands {
            let outcome = self.run_one(spec, None).await?;
            if !outcome.is_success() {
                return Ok(outcome);
            }
        }
        Ok(ExecOutcome::Success)
    }

    async fn run_one(
        &self,
        spec: &CommandSpec,
        deadline: Option<std::time::Duration>,
    ) -> Result<ExecOutcome, StopReason> {
        let cwd = spec.working_dir(&self.plan.project_dir);
        self.runner
            .run(spec, &cwd, deadline)
            .await
            .map_err(|e| StopReason::Error(e.to_string()))
    }

    fn verify_package(&self) -> Result<ExecOutcome, StopReason> {
        if output_present(&self.plan.package_output) {
            Ok(ExecOutcome::Success)
        } else {
            error!(
                output = %self.plan.package_output.display(),
                "Packaging reported success but produced no output"
            );
            Err(StopReason::VerificationFailed(self.plan.package_output.clone()))
        }
    }
}

fn output_present(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn plan(project_dir: &Path) -> StagePlan {
        StagePlan {
            project_dir: project_dir.to_path_buf(),
            init: vec![CommandSpec::new("init-a", &[]), CommandSpec::new("init-b", &[])],
            build: CommandSpec::new("build", &[]),
            package: vec![CommandSpec::new("package", &[])],
            package_output: project_dir.join("dist"),
        }
    }

    fn build_machine(dir: &Path, runner: ScriptedRunner) -> (StageMachine, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let machine = StageMachine::new(
            plan(dir),
            runner.clone(),
            StageMarker::new(dir.join(".baton/stage")),
            BudgetLimits::new(Duration::from_secs(270 * 60), Duration::from_secs(10 * 60)),
        );
        (machine, runner)
    }

    fn state(stage: Stage) -> RunState {
        RunState::new("1.85.74", stage, Utc::now())
    }

    fn marker(dir: &Path) -> Option<Stage> {
        StageMarker::new(dir.join(".baton/stage")).read().unwrap()
    }

    #[tokio::test]
    async fn test_success_advances_marker() {
        let dir = tempdir().unwrap();
        let (machine, _) = build_machine(dir.path(), ScriptedRunner::new());
        let mut st = state(Stage::Init);
        let result = machine.step(&mut st).await;
        assert_eq!(
            result,
            StepResult::Advanced {
                from: Stage::Init,
                to: Stage::Build
            }
        );
        assert_eq!(st.stage, Stage::Build);
        assert_eq!(marker(dir.path()), Some(Stage::Build));
    }

    #[tokio::test]
    async fn test_marker_advances_only_on_success() {
        let cases = [
            (ExecOutcome::Timeout, StopReason::Timeout),
            (ExecOutcome::Failure(2), StopReason::Failure(2)),
        ];
        for (outcome, reason) in cases {
            let dir = tempdir().unwrap();
            StageMarker::new(dir.path().join(".baton/stage"))
                .write(Stage::Build)
                .unwrap();
            let (machine, _) = build_machine(dir.path(), ScriptedRunner::new().script("build", outcome));
            let mut st = state(Stage::Build);
            assert_eq!(machine.step(&mut st).await, StepResult::Stopped(reason));
            assert_eq!(st.stage, Stage::Build);
            assert_eq!(marker(dir.path()), Some(Stage::Build));
        }
    }

    #[tokio::test]
    async fn test_init_stops_at_first_failing_command() {
        let dir = tempdir().unwrap();
        let (machine, runner) = build_machine(
            dir.path(),
            ScriptedRunner::new().script("init-a", ExecOutcome::Failure(1)),
        );
        let mut st = state(Stage::Init);
        let outcome = machine.run(&mut st).await;
        assert_eq!(
            outcome,
            MachineOutcome::Stopped {
                stage: Stage::Init,
                reason: StopReason::Failure(1)
            }
        );
        assert_eq!(runner.commands(), vec!["init-a"]);
        assert_eq!(marker(dir.path()), None);
    }

    #[tokio::test]
    async fn test_only_build_gets_a_deadline() {
        let dir = tempdir().unwrap();
        let (machine, runner) = build_machine(
            dir.path(),
            ScriptedRunner::new().effect("package", |cwd| {
                std::fs::create_dir_all(cwd.join("dist")).unwrap();
            }),
        );
        let mut st = state(Stage::Init);
        assert_eq!(machine.run(&mut st).await, MachineOutcome::Done);
        assert_eq!(runner.commands(), vec!["init-a", "init-b", "build", "package"]);
        assert!(runner.deadline_of("init-a").is_none());
        assert!(runner.deadline_of("package").is_none());
        let budget = runner.deadline_of("build").unwrap();
        assert!(budget <= Duration::from_secs(270 * 60));
        assert!(budget >= Duration::from_secs(269 * 60));
    }

    #[tokio::test]
    async fn test_build_budget_uses_job_start() {
        let dir = tempdir().unwrap();
        let (machine, runner) = build_machine(dir.path(), ScriptedRunner::new());
        let mut st = RunState::new(
            "1.85.74",
            Stage::Build,
            Utc::now() - chrono::Duration::minutes(265),
        );
        machine.step(&mut st).await;
        assert_eq!(runner.deadline_of("build"), Some(Duration::from_secs(10 * 60)));
    }

    #[tokio::test]
    async fn test_package_without_output_is_verification_failure() {
        let dir = tempdir().unwrap();
        StageMarker::new(dir.path().join(".baton/stage"))
            .write(Stage::Package)
            .unwrap();
        let (machine, _) = build_machine(dir.path(), ScriptedRunner::new());
        let mut st = state(Stage::Package);
        let outcome = machine.run(&mut st).await;
        assert_eq!(
            outcome,
            MachineOutcome::Stopped {
                stage: Stage::Package,
                reason: StopReason::VerificationFailed(dir.path().join("dist"))
            }
        );
        assert_eq!(marker(dir.path()), Some(Stage::Package));
    }

    #[tokio::test]
    async fn test_package_with_output_is_done_and_marker_stays() {
        let dir = tempdir().unwrap();
        StageMarker::new(dir.path().join(".baton/stage"))
            .write(Stage::Package)
            .unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        let (machine, _) = build_machine(dir.path(), ScriptedRunner::new());
        let mut st = state(Stage::Package);
        assert!(machine.run(&mut st).await.is_done());
        assert_eq!(st.stage, Stage::Done);
        assert_eq!(marker(dir.path()), Some(Stage::Package));
    }

    #[tokio::test]
    async fn test_spawn_error_becomes_stop_not_panic() {
        let dir = tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let mut p = plan(dir.path());
        p.build = CommandSpec::new("missing-program", &[]);
        let machine = StageMachine::new(
            p,
            runner,
            StageMarker::new(dir.path().join(".baton/stage")),
            BudgetLimits::new(Duration::from_secs(60), Duration::from_secs(10)),
        );
        let mut st = state(Stage::Build);
        match machine.step(&mut st).await {
            StepResult::Stopped(StopReason::Error(msg)) => assert!(msg.contains("missing-program")),
            other => panic!("expected error stop, got {other:?}"),
        }
        assert_eq!(st.stage, Stage::Build);
    }

    #[tokio::test]
    async fn test_commands_run_in_their_directory() {
        let dir = tempdir().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_in = seen.clone();
        let runner = ScriptedRunner::new().effect("build", move |cwd| {
            *seen_in.lock().unwrap() = Some(cwd.to_path_buf());
        });
        let runner = Arc::new(runner);
        let mut p = plan(dir.path());
        p.build = CommandSpec::new("build", &[]).in_dir("src/brave");
        let machine = StageMachine::new(
            p,
            runner,
            StageMarker::new(dir.path().join(".baton/stage")),
            BudgetLimits::new(Duration::from_secs(60), Duration::from_secs(10)),
        );
        machine.step(&mut state(Stage::Build)).await;
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(dir.path().join("src/brave"))
        );
    }
}
