use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::baton_config::{BatonToml, StoreBackend};
use crate::transport::{DirStore, HttpStore, RemoteStore, RetryPolicy};

/// Runtime configuration for baton.
///
/// Resolves every path the driver touches against the project directory and
/// carries the parsed `baton.toml` with environment overrides applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub baton_dir: PathBuf,
    pub config_file: PathBuf,
    /// Persisted stage marker
    pub marker_file: PathBuf,
    /// Scratch space for archives and downloads
    pub tmp_dir: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    pub toml: BatonToml,
}

impl Config {
    /// Load configuration for `project_dir`, reading `config_file` when given,
    /// else `.baton/baton.toml` (defaults if absent).
    pub fn new(project_dir: PathBuf, config_file: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let baton_dir = project_dir.join(".baton");
        let (config_file, mut toml) = match config_file {
            Some(path) => {
                let toml = BatonToml::load(&path)?;
                (path, toml)
            }
            None => (
                baton_dir.join("baton.toml"),
                BatonToml::load_or_default(&baton_dir)?,
            ),
        };
        toml.apply_env(|key| std::env::var(key).ok());
        Ok(Self::from_parts(project_dir, config_file, toml, verbose))
    }

    /// Assemble from an already-parsed file model, without touching the environment.
    pub fn from_parts(
        project_dir: PathBuf,
        config_file: PathBuf,
        toml: BatonToml,
        verbose: bool,
    ) -> Self {
        let baton_dir = project_dir.join(".baton");
        Self {
            marker_file: baton_dir.join("stage"),
            tmp_dir: baton_dir.join("tmp"),
            log_dir: baton_dir.join("logs"),
            project_dir,
            baton_dir,
            config_file,
            verbose,
            toml,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.tmp_dir).context("Failed to create tmp directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn version_file(&self) -> PathBuf {
        self.project_dir.join(&self.toml.job.version_file)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.project_dir.join(&self.toml.job.work_dir)
    }

    pub fn package_output(&self) -> PathBuf {
        self.project_dir.join(&self.toml.stages.package.output)
    }

    /// Entries captured by a checkpoint, relative to the project directory.
    pub fn checkpoint_entries(&self) -> Vec<PathBuf> {
        let marker = self
            .marker_file
            .strip_prefix(&self.project_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(".baton/stage"));
        vec![self.toml.job.work_dir.clone(), marker]
    }

    /// Paths, relative to the project directory, that archives never walk into:
    /// baton's own state directory and a dir-backed store living in the tree.
    pub fn archive_excludes(&self) -> Vec<PathBuf> {
        let mut excludes = Vec::new();
        if let Ok(rel) = self.baton_dir.strip_prefix(&self.project_dir) {
            excludes.push(rel.to_path_buf());
        }
        if self.toml.transport.backend == StoreBackend::Dir
            && let Some(dir) = &self.toml.transport.dir
            && let Ok(rel) = self.project_dir.join(dir).strip_prefix(&self.project_dir)
            && !rel.as_os_str().is_empty()
        {
            excludes.push(rel.to_path_buf());
        }
        excludes
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.toml.transport.attempts.max(1),
            delay: self.toml.transport.retry_delay(),
        }
    }

    /// Construct the configured remote store backend.
    pub fn open_store(&self) -> Result<Arc<dyn RemoteStore>> {
        let transport = &self.toml.transport;
        match transport.backend {
            StoreBackend::Dir => {
                let dir = transport
                    .dir
                    .as_ref()
                    .context("transport.dir is not configured")?;
                Ok(Arc::new(DirStore::new(self.project_dir.join(dir))))
            }
            StoreBackend::Http => {
                let url = transport
                    .url
                    .as_ref()
                    .context("transport.url is not configured")?;
                let token = std::env::var(&transport.token_env)
                    .ok()
                    .filter(|t| !t.is_empty());
                Ok(Arc::new(HttpStore::new(url.clone(), token)))
            }
        }
    }
}
