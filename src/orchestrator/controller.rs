//! Invocation Controller.
//!
//! One invocation: read the build version, short-circuit if the job is already
//! finished, optionally restore the last checkpoint, drive the stage machine,
//! then publish either the final artifact or a checkpoint. Every path that gets
//! past version and resumption ends in exactly one [`CompletionSignal`].

use super::machine::{MachineOutcome, StageMachine, StagePlan};
use super::state::{RunState, StageMarker};
use crate::archive::ArchiveCodec;
use crate::budget::BudgetLimits;
use crate::config::Config;
use crate::errors::{InvocationError, TransportError};
use crate::exec::CommandRunner;
use crate::transport::{ArtifactTransport, RemoteStore, UploadOptions};
use crate::ui::RunUI;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Caller-supplied inputs of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvocationFlags {
    /// The caller already knows the job finished
    pub finished: bool,
    /// Resume from the last published checkpoint
    pub from_artifact: bool,
}

/// The single boolean reported at the end of every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionSignal {
    pub finished: bool,
}

impl CompletionSignal {
    pub fn finished() -> Self {
        Self { finished: true }
    }

    pub fn not_finished() -> Self {
        Self { finished: false }
    }

    /// `key=value` line understood by CI output files.
    pub fn line(&self) -> String {
        format!("finished={}", self.finished)
    }

    /// Print the signal on stdout and append it to `output_file`, if any.
    pub fn emit(&self, output_file: Option<&Path>) -> Result<()> {
        println!("{}", self.line());
        if let Some(path) = output_file {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open signal output {}", path.display()))?;
            writeln!(file, "{}", self.line())
                .with_context(|| format!("Failed to write signal output {}", path.display()))?;
        }
        Ok(())
    }
}

pub struct Controller {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    codec: Arc<dyn ArchiveCodec>,
    transport: ArtifactTransport,
    job_started_at: Option<DateTime<Utc>>,
    ui: Option<Arc<RunUI>>,
}

impl Controller {
    pub fn new(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        codec: Arc<dyn ArchiveCodec>,
        store: Arc<dyn RemoteStore>,
    ) -> Self {
        let transport = ArtifactTransport::new(store, config.retry_policy());
        Self {
            config,
            runner,
            codec,
            transport,
            job_started_at: None,
            ui: None,
        }
    }

    /// Measure the Build budget from `at` instead of the invocation start.
    pub fn with_job_started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.job_started_at = at;
        self
    }

    pub fn with_ui(mut self, ui: Arc<RunUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub async fn invoke(&self, flags: InvocationFlags) -> Result<CompletionSignal, InvocationError> {
        let job_started_at = self.job_started_at.unwrap_or_else(Utc::now);
        let version = read_version(&self.config.version_file())?;
        info!(%version, finished = flags.finished, from_artifact = flags.from_artifact, "Invocation started");

        if flags.finished {
            info!(%version, "Job already finished, nothing to do");
            return Ok(CompletionSignal::finished());
        }

        let plan = StagePlan::from_config(&self.config)?;
        if let Err(e) = self.config.ensure_directories() {
            return Err(InvocationError::Configuration(format!("{:#}", e)));
        }

        if flags.from_artifact {
            self.restore_checkpoint().await?;
        }

        let marker = StageMarker::new(self.config.marker_file.clone());
        let stage = marker
            .read_or_init()
            .map_err(|e| InvocationError::Resumption {
                name: self.config.toml.checkpoint.name.clone(),
                message: format!("{:#}", e),
            })?;
        info!(%stage, "Resuming at stage");

        let mut state = RunState::new(version, stage, job_started_at);
        let job = &self.config.toml.job;
        let mut machine = StageMachine::new(
            plan,
            self.runner.clone(),
            marker,
            BudgetLimits::new(job.ceiling(), job.floor()),
        );
        if let Some(ref ui) = self.ui {
            machine = machine.with_ui(ui.clone());
        }

        let outcome = machine.run(&mut state).await;
        let signal = self.conclude(&state, &outcome).await;
        info!(
            version = %state.version,
            stage = %state.stage,
            finished = signal.finished,
            "Invocation complete"
        );
        Ok(signal)
    }

    /// Publish the final artifact when the run is done, else a checkpoint.
    async fn conclude(&self, state: &RunState, outcome: &MachineOutcome) -> CompletionSignal {
        if outcome.is_done() {
            match self.publish_final(state).await {
                Ok(name) => {
                    if let Some(ref ui) = self.ui {
                        ui.artifact_published(&name);
                    }
                    // The final artifact supersedes the checkpoint
                    self.transport
                        .delete(&self.config.toml.checkpoint.name)
                        .await;
                    return CompletionSignal::finished();
                }
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Final artifact publication failed, falling back to checkpoint");
                }
            }
        }

        if outcome.is_timeout() {
            self.settle().await;
        }
        if let Err(e) = self.publish_checkpoint().await {
            error!(
                error = %format!("{:#}", e),
                "Checkpoint publication failed, next invocation may redo work"
            );
        }
        CompletionSignal::not_finished()
    }

    /// Let interrupted build tooling finish writing, then flush to disk.
    async fn settle(&self) {
        let settle = self.config.toml.job.settle();
        if !settle.is_zero() {
            info!(secs = settle.as_secs(), "Settling before checkpoint");
            tokio::time::sleep(settle).await;
        }
        nix::unistd::sync();
    }

    async fn publish_checkpoint(&self) -> Result<()> {
        let section = &self.config.toml.checkpoint;
        let archive = self.archive_path(&section.name);
        self.codec
            .create(
                &self.config.project_dir,
                &self.config.checkpoint_entries(),
                &archive,
                section.compression,
            )
            .await
            .context("Failed to create checkpoint archive")?;

        let result = self
            .upload(&section.name, &archive, section.retention_days)
            .await;
        remove_quietly(&archive);
        result.context("Failed to upload checkpoint")?;

        info!(checkpoint = %section.name, "Checkpoint published");
        if let Some(ref ui) = self.ui {
            ui.checkpoint_published(&section.name);
        }
        Ok(())
    }

    async fn publish_final(&self, state: &RunState) -> Result<String> {
        let section = &self.config.toml.artifact;
        let name = section.name_for(&state.version);
        let archive = self.archive_path(&name);
        let (root, entry) = split_output(
            &self.config.project_dir,
            &self.config.toml.stages.package.output,
        );
        self.codec
            .create(&root, &[entry], &archive, section.compression)
            .await
            .context("Failed to create final artifact archive")?;

        let result = self.upload(&name, &archive, section.retention_days).await;
        remove_quietly(&archive);
        result.context("Failed to upload final artifact")?;

        info!(artifact = %name, "Final artifact published");
        Ok(name)
    }

    async fn upload(
        &self,
        name: &str,
        archive: &Path,
        retention_days: u32,
    ) -> Result<(), TransportError> {
        self.transport
            .publish(
                name,
                &[archive.to_path_buf()],
                &self.config.tmp_dir,
                &UploadOptions::retention(retention_days),
            )
            .await
            .map(|_| ())
    }

    /// Download the checkpoint and extract it over the project directory.
    async fn restore_checkpoint(&self) -> Result<(), InvocationError> {
        let name = self.config.toml.checkpoint.name.clone();
        let resumption = |message: String| InvocationError::Resumption {
            name: name.clone(),
            message,
        };

        let download_dir = self.config.tmp_dir.join("restore");
        if download_dir.exists() {
            std::fs::remove_dir_all(&download_dir).map_err(|e| resumption(e.to_string()))?;
        }
        let files = self
            .transport
            .download(&name, &download_dir)
            .await
            .map_err(|e| resumption(e.to_string()))?;
        let archive = files
            .iter()
            .find(|f| f.to_string_lossy().ends_with(".tar.gz"))
            .or(files.first())
            .ok_or_else(|| resumption("checkpoint contains no files".to_string()))?;

        self.codec
            .restore(archive, &self.config.project_dir)
            .await
            .map_err(|e| resumption(e.to_string()))?;
        if let Err(e) = std::fs::remove_dir_all(&download_dir) {
            warn!(error = %e, "Failed to clean up downloaded checkpoint");
        }
        info!(checkpoint = %name, "Checkpoint restored");
        Ok(())
    }

    fn archive_path(&self, name: &str) -> PathBuf {
        self.config.tmp_dir.join(format!("{}.tar.gz", name))
    }
}

/// Read and trim the build version; absence or emptiness is fatal.
pub fn read_version(path: &Path) -> Result<String, InvocationError> {
    let raw = std::fs::read_to_string(path).map_err(|source| InvocationError::VersionUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let version = raw.trim();
    if version.is_empty() {
        return Err(InvocationError::VersionEmpty {
            path: path.to_path_buf(),
        });
    }
    Ok(version.to_string())
}

/// Archive root and entry for the package output: relative outputs are archived
/// from the project directory, absolute ones from their parent.
fn split_output(project_dir: &Path, output: &Path) -> (PathBuf, PathBuf) {
    if output.is_relative() {
        return (project_dir.to_path_buf(), output.to_path_buf());
    }
    match output.strip_prefix(project_dir) {
        Ok(rel) => (project_dir.to_path_buf(), rel.to_path_buf()),
        Err(_) => (
            output.parent().map(Path::to_path_buf).unwrap_or_default(),
            output
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| output.to_path_buf()),
        ),
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove temporary archive");
    }
}
