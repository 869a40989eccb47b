//! Subprocess execution seam.
//!
//! Stage handlers never spawn processes directly; they hand a [`CommandSpec`] to a
//! [`CommandRunner`]. The production runner is [`timed::TimedExecutor`]; tests
//! substitute scripted doubles.

pub mod timed;

pub use timed::TimedExecutor;

use crate::errors::ExecError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit code reserved for "deadline exceeded" by delegated tools.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// A single external command, as written in `baton.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute (looked up on `PATH`)
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(cmd: impl Into<String>, args: &[&str]) -> Self {
        Self {
            cmd: cmd.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Resolve the working directory against the project directory.
    pub fn working_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.dir {
            Some(d) if d.is_absolute() => d.clone(),
            Some(d) => project_dir.join(d),
            None => project_dir.to_path_buf(),
        }
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.cmd.clone()
        } else {
            format!("{} {}", self.cmd, self.args.join(" "))
        }
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Exited 0
    Success,
    /// Still running when its deadline elapsed (or exited with the reserved code 124)
    Timeout,
    /// Exited nonzero for any other reason
    Failure(i32),
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success)
    }
}

impl std::fmt::Display for ExecOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecOutcome::Success => write!(f, "success"),
            ExecOutcome::Timeout => write!(f, "deadline exceeded"),
            ExecOutcome::Failure(code) => write!(f, "failed with exit code {}", code),
        }
    }
}

/// Abstraction over running external commands, for testability.
/// Real implementation: `TimedExecutor`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` in `cwd`. With a `deadline` the command is interrupted once it
    /// elapses and the outcome is [`ExecOutcome::Timeout`].
    async fn run(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        deadline: Option<Duration>,
    ) -> Result<ExecOutcome, ExecError>;
}
