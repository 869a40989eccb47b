use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One ordered phase of the build. `Done` is terminal and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Init,
    Build,
    Package,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Init, Stage::Build, Stage::Package, Stage::Done];

    /// Successor in the linear order; `Done` is its own successor.
    pub fn next(self) -> Stage {
        match self {
            Stage::Init => Stage::Build,
            Stage::Build => Stage::Package,
            Stage::Package | Stage::Done => Stage::Done,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Done
    }

    /// Zero-based position, used for progress display.
    pub fn index(self) -> usize {
        match self {
            Stage::Init => 0,
            Stage::Build => 1,
            Stage::Package => 2,
            Stage::Done => 3,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Init => write!(f, "Init"),
            Stage::Build => write!(f, "Build"),
            Stage::Package => write!(f, "Package"),
            Stage::Done => write!(f, "Done"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "init" => Ok(Stage::Init),
            "build" => Ok(Stage::Build),
            "package" => Ok(Stage::Package),
            "done" => Ok(Stage::Done),
            _ => bail!(
                "Invalid stage '{}'. Valid values: Init, Build, Package",
                s.trim()
            ),
        }
    }
}

/// Durable single-value stage marker.
///
/// The stored stage is read back verbatim on restart; it is never inferred
/// from the state of the working tree.
pub struct StageMarker {
    marker_file: PathBuf,
}

impl StageMarker {
    pub fn new(marker_file: PathBuf) -> Self {
        Self { marker_file }
    }

    pub fn path(&self) -> &Path {
        &self.marker_file
    }

    pub fn exists(&self) -> bool {
        self.marker_file.exists()
    }

    /// Stage stored in the marker, or `None` when no marker exists.
    pub fn read(&self) -> Result<Option<Stage>> {
        if !self.marker_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.marker_file)
            .with_context(|| format!("Failed to read stage marker {}", self.marker_file.display()))?;
        let stage = content
            .parse::<Stage>()
            .with_context(|| format!("Corrupt stage marker {}", self.marker_file.display()))?;
        Ok(Some(stage))
    }

    /// Overwrite the marker. Written to a sibling temp file then renamed, so a
    /// reader never observes a partial value.
    pub fn write(&self, stage: Stage) -> Result<()> {
        if stage.is_terminal() {
            bail!("Stage {} is terminal and is not persisted", stage);
        }
        if let Some(parent) = self.marker_file.parent() {
            fs::create_dir_all(parent).context("Failed to create marker directory")?;
        }
        let tmp = self.marker_file.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).context("Failed to create stage marker")?;
            writeln!(file, "{}", stage).context("Failed to write stage marker")?;
            file.sync_all().context("Failed to flush stage marker")?;
        }
        fs::rename(&tmp, &self.marker_file).context("Failed to replace stage marker")?;
        Ok(())
    }

    /// Read the marker, creating it as `Init` when absent.
    pub fn read_or_init(&self) -> Result<Stage> {
        match self.read()? {
            Some(stage) => Ok(stage),
            None => {
                self.write(Stage::Init)?;
                Ok(Stage::Init)
            }
        }
    }

    pub fn reset(&self) -> Result<()> {
        if self.marker_file.exists() {
            fs::remove_file(&self.marker_file).context("Failed to remove stage marker")?;
        }
        Ok(())
    }
}

/// Per-invocation state, constructed once at invocation start and passed by
/// reference to everything that needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub version: String,
    pub stage: Stage,
    /// Start of the job window that the Build budget is measured against
    pub job_started_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(version: impl Into<String>, stage: Stage, job_started_at: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            stage,
            job_started_at,
        }
    }

    /// Time since job start as of `now`; zero if the start lies in the future.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.job_started_at).to_std().unwrap_or_default()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_marker() -> (StageMarker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".baton/stage");
        (StageMarker::new(path), dir)
    }

    #[test]
    fn test_stage_order_is_linear() {
        assert_eq!(Stage::Init.next(), Stage::Build);
        assert_eq!(Stage::Build.next(), Stage::Package);
        assert_eq!(Stage::Package.next(), Stage::Done);
        assert_eq!(Stage::Done.next(), Stage::Done);
        assert!(Stage::Init < Stage::Build && Stage::Build < Stage::Package);
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("Init".parse::<Stage>().unwrap(), Stage::Init);
        assert_eq!("build\n".parse::<Stage>().unwrap(), Stage::Build);
        assert_eq!("  PACKAGE ".parse::<Stage>().unwrap(), Stage::Package);
        let err = "compile".parse::<Stage>().unwrap_err();
        assert!(err.to_string().contains("Invalid stage"));
    }

    #[test]
    fn test_marker_absent_reads_none() {
        let (marker, _dir) = make_marker();
        assert!(!marker.exists());
        assert!(marker.read().unwrap().is_none());
    }

    #[test]
    fn test_marker_read_or_init_creates_init() {
        let (marker, _dir) = make_marker();
        assert_eq!(marker.read_or_init().unwrap(), Stage::Init);
        assert_eq!(
            fs::read_to_string(marker.path()).unwrap().trim(),
            "Init"
        );
    }

    #[test]
    fn test_marker_write_overwrites() {
        let (marker, _dir) = make_marker();
        marker.write(Stage::Build).unwrap();
        marker.write(Stage::Package).unwrap();
        assert_eq!(marker.read().unwrap(), Some(Stage::Package));
        assert!(!marker.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_marker_refuses_terminal_stage() {
        let (marker, _dir) = make_marker();
        assert!(marker.write(Stage::Done).is_err());
        assert!(!marker.exists());
    }

    #[test]
    fn test_marker_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stage");
        StageMarker::new(path.clone()).write(Stage::Build).unwrap();
        assert_eq!(StageMarker::new(path).read().unwrap(), Some(Stage::Build));
    }

    #[test]
    fn test_corrupt_marker_is_an_error() {
        let (marker, _dir) = make_marker();
        fs::create_dir_all(marker.path().parent().unwrap()).unwrap();
        fs::write(marker.path(), "halfway").unwrap();
        let err = marker.read().unwrap_err();
        assert!(err.to_string().contains("Corrupt stage marker"));
    }

    #[test]
    fn test_reset_removes_marker() {
        let (marker, _dir) = make_marker();
        marker.write(Stage::Build).unwrap();
        marker.reset().unwrap();
        assert!(marker.read().unwrap().is_none());
        marker.reset().unwrap();
    }

    #[test]
    fn test_run_state_elapsed() {
        let started = Utc::now() - chrono::Duration::minutes(30);
        let state = RunState::new("1.85.74", Stage::Build, started);
        let elapsed = state.elapsed_at(started + chrono::Duration::minutes(30));
        assert_eq!(elapsed, Duration::from_secs(1800));
        assert_eq!(state.elapsed_at(started - chrono::Duration::minutes(1)), Duration::ZERO);
    }
}
