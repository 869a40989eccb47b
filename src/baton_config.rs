//! The `baton.toml` file model.
//!
//! Reads `.baton/baton.toml`. Every field carries a serde default, so an absent
//! or partial file still yields a complete configuration; values are layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [job]
//! ceiling_minutes = 270
//! floor_minutes = 10
//! version_file = "version.txt"
//! work_dir = "src"
//!
//! [[stages.init.commands]]
//! cmd = "npm"
//! args = ["run", "init"]
//!
//! [stages.build]
//! command = { cmd = "npm", args = ["run", "build", "Release"], dir = "src/brave" }
//! grace_secs = 300
//!
//! [stages.package]
//! output = "src/out/Release/packages"
//! [[stages.package.commands]]
//! cmd = "npm"
//! args = ["run", "create_dist", "Release"]
//!
//! [checkpoint]
//! name = "checkpoint"
//! retention_days = 1
//!
//! [artifact]
//! name = "{version}"
//! retention_days = 7
//!
//! [transport]
//! backend = "dir"
//! dir = "/mnt/artifacts"
//! ```

use crate::archive::CompressionProfile;
use crate::exec::CommandSpec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `[transport] dir`.
pub const ENV_STORE_DIR: &str = "BATON_STORE_DIR";
/// Environment variable overriding `[transport] url`.
pub const ENV_STORE_URL: &str = "BATON_STORE_URL";
/// Fallback for `[signal] output_file`.
pub const ENV_GITHUB_OUTPUT: &str = "GITHUB_OUTPUT";

/// Job-wide timing and layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSection {
    /// Hard wall-clock ceiling for the whole invocation window
    #[serde(default = "default_ceiling_minutes")]
    pub ceiling_minutes: u64,
    /// Minimum budget the Build stage always receives
    #[serde(default = "default_floor_minutes")]
    pub floor_minutes: u64,
    /// File holding the build version, relative to the project directory
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,
    /// Working tree captured by checkpoints, relative to the project directory
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Pause before syncing and archiving after a deadline
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

fn default_ceiling_minutes() -> u64 {
    270
}

fn default_floor_minutes() -> u64 {
    10
}

fn default_version_file() -> PathBuf {
    PathBuf::from("version.txt")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("src")
}

fn default_settle_secs() -> u64 {
    10
}

fn default_progress_interval_secs() -> u64 {
    300
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            ceiling_minutes: default_ceiling_minutes(),
            floor_minutes: default_floor_minutes(),
            version_file: default_version_file(),
            work_dir: default_work_dir(),
            settle_secs: default_settle_secs(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

impl JobSection {
    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_minutes.saturating_mul(60))
    }

    pub fn floor(&self) -> Duration {
        Duration::from_secs(self.floor_minutes.saturating_mul(60))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitStage {
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStage {
    #[serde(default)]
    pub command: Option<CommandSpec>,
    /// Wait between the deadline interrupt and the forced kill
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

fn default_grace_secs() -> u64 {
    300
}

impl Default for BuildStage {
    fn default() -> Self {
        Self {
            command: None,
            grace_secs: default_grace_secs(),
        }
    }
}

impl BuildStage {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStage {
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    /// Location whose presence proves packaging produced output
    #[serde(default = "default_package_output")]
    pub output: PathBuf,
}

fn default_package_output() -> PathBuf {
    PathBuf::from("dist")
}

impl Default for PackageStage {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            output: default_package_output(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagesSection {
    #[serde(default)]
    pub init: InitStage,
    #[serde(default)]
    pub build: BuildStage,
    #[serde(default)]
    pub package: PackageStage,
}

/// The reused resumption slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_name")]
    pub name: String,
    #[serde(default = "default_checkpoint_retention")]
    pub retention_days: u32,
    #[serde(default)]
    pub compression: CompressionProfile,
}

fn default_checkpoint_name() -> String {
    "checkpoint".to_string()
}

fn default_checkpoint_retention() -> u32 {
    1
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            name: default_checkpoint_name(),
            retention_days: default_checkpoint_retention(),
            compression: CompressionProfile::Fast,
        }
    }
}

/// The version-named final output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSection {
    /// Name template; `{version}` is replaced by the build version
    #[serde(default = "default_artifact_name")]
    pub name: String,
    #[serde(default = "default_artifact_retention")]
    pub retention_days: u32,
    #[serde(default = "default_artifact_compression")]
    pub compression: CompressionProfile,
}

fn default_artifact_name() -> String {
    "{version}".to_string()
}

fn default_artifact_retention() -> u32 {
    7
}

fn default_artifact_compression() -> CompressionProfile {
    CompressionProfile::Best
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            name: default_artifact_name(),
            retention_days: default_artifact_retention(),
            compression: default_artifact_compression(),
        }
    }
}

impl ArtifactSection {
    /// Artifact name for `version`. Characters a store name cannot carry
    /// (`+` in `1.85.74+linux`, say) become `_`.
    pub fn name_for(&self, version: &str) -> String {
        crate::transport::sanitize_name(&self.name.replace("{version}", version))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared filesystem path
    #[default]
    Dir,
    /// REST blob service
    Http,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Dir => write!(f, "dir"),
            StoreBackend::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Environment variable holding the bearer token for the http backend
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_token_env() -> String {
    "BATON_STORE_TOKEN".to_string()
}

fn default_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    10
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            dir: None,
            url: None,
            token_env: default_token_env(),
            attempts: default_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl TransportSection {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSection {
    /// File the completion signal is appended to as `finished=<bool>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
}

/// The complete baton.toml configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatonToml {
    #[serde(default)]
    pub job: JobSection,
    #[serde(default)]
    pub stages: StagesSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub artifact: ArtifactSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub signal: SignalSection,
}

impl BatonToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse baton.toml")
    }

    /// Load `baton.toml` from `baton_dir`, or defaults if the file doesn't exist.
    pub fn load_or_default(baton_dir: &Path) -> Result<Self> {
        let config_path = baton_dir.join("baton.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize baton.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = non_empty(ENV_STORE_DIR) {
            self.transport.backend = StoreBackend::Dir;
            self.transport.dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = non_empty(ENV_STORE_URL) {
            self.transport.backend = StoreBackend::Http;
            self.transport.url = Some(url);
        }
        if self.signal.output_file.is_none()
            && let Some(path) = non_empty(ENV_GITHUB_OUTPUT)
        {
            self.signal.output_file = Some(PathBuf::from(path));
        }
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.job.floor_minutes > self.job.ceiling_minutes {
            problems.push(format!(
                "job.floor_minutes ({}) exceeds job.ceiling_minutes ({})",
                self.job.floor_minutes, self.job.ceiling_minutes
            ));
        }
        if self.job.version_file.as_os_str().is_empty() {
            problems.push("job.version_file must not be empty".to_string());
        }
        if self.job.work_dir.as_os_str().is_empty() {
            problems.push("job.work_dir must not be empty".to_string());
        }
        match &self.stages.build.command {
            None => problems.push("stages.build.command is required".to_string()),
            Some(cmd) if cmd.cmd.trim().is_empty() => {
                problems.push("stages.build.command.cmd must not be empty".to_string())
            }
            Some(_) => {}
        }
        for (i, cmd) in self.stages.init.commands.iter().enumerate() {
            if cmd.cmd.trim().is_empty() {
                problems.push(format!("stages.init.commands[{}].cmd must not be empty", i));
            }
        }
        for (i, cmd) in self.stages.package.commands.iter().enumerate() {
            if cmd.cmd.trim().is_empty() {
                problems.push(format!("stages.package.commands[{}].cmd must not be empty", i));
            }
        }
        if self.stages.package.output.as_os_str().is_empty() {
            problems.push("stages.package.output must not be empty".to_string());
        }
        if let Err(e) = crate::transport::validate_name(&self.checkpoint.name) {
            problems.push(format!("checkpoint.name: {}", e));
        }
        if !self.artifact.name.contains("{version}") {
            problems.push(format!(
                "artifact.name '{}' must contain the {{version}} placeholder",
                self.artifact.name
            ));
        } else if self.artifact.name_for("0") == self.checkpoint.name {
            problems.push("artifact.name must differ from checkpoint.name".to_string());
        }
        if self.transport.attempts < 1 {
            problems.push("transport.attempts must be at least 1".to_string());
        }
        match self.transport.backend {
            StoreBackend::Dir if self.transport.dir.is_none() => problems.push(format!(
                "transport.dir (or {}) is required for the dir backend",
                ENV_STORE_DIR
            )),
            StoreBackend::Http if self.transport.url.is_none() => problems.push(format!(
                "transport.url (or {}) is required for the http backend",
                ENV_STORE_URL
            )),
            _ => {}
        }

        problems
    }
}

/// Commented starter file written by `baton config init`.
pub const DEFAULT_TEMPLATE: &str = r#"# baton configuration

[job]
# Wall-clock window of one invocation, and the minimum Build budget.
ceiling_minutes = 270
floor_minutes = 10
version_file = "version.txt"
work_dir = "src"
settle_secs = 10
progress_interval_secs = 300

# Run to completion, in order, without a deadline.
[[stages.init.commands]]
cmd = "npm"
args = ["run", "init"]

[stages.build]
command = { cmd = "npm", args = ["run", "build", "Release"] }
grace_secs = 300

[stages.package]
output = "src/out/Release/packages"

[[stages.package.commands]]
cmd = "npm"
args = ["run", "create_dist", "Release"]

[checkpoint]
name = "checkpoint"
retention_days = 1
compression = "fast"

[artifact]
name = "{version}"
retention_days = 7
compression = "best"

[transport]
backend = "dir"
dir = "/mnt/baton-store"
attempts = 5
retry_delay_secs = 10

[signal]
# Defaults to $GITHUB_OUTPUT when unset.
# output_file = "baton-output.txt"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_baton_toml_parse_empty() {
        let config = BatonToml::parse("").unwrap();
        assert_eq!(config, BatonToml::default());
        assert_eq!(config.job.ceiling_minutes, 270);
        assert_eq!(config.job.floor_minutes, 10);
        assert_eq!(config.checkpoint.name, "checkpoint");
        assert_eq!(config.checkpoint.retention_days, 1);
        assert_eq!(config.checkpoint.compression, CompressionProfile::Fast);
        assert_eq!(config.artifact.retention_days, 7);
        assert_eq!(config.artifact.compression, CompressionProfile::Best);
        assert_eq!(config.transport.attempts, 5);
        assert_eq!(config.transport.retry_delay(), Duration::from_secs(10));
        assert_eq!(config.stages.build.grace(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_template_parses_and_validates() {
        let config = BatonToml::parse(DEFAULT_TEMPLATE).unwrap();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.stages.init.commands.len(), 1);
        assert_eq!(
            config.stages.build.command.as_ref().map(|c| c.cmd.as_str()),
            Some("npm")
        );
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = BatonToml::parse(
            r#"
            [job]
            ceiling_minutes = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.job.ceiling_minutes, 60);
        assert_eq!(config.job.floor_minutes, 10);
        assert_eq!(config.job.ceiling(), Duration::from_secs(3600));
    }

    #[test]
    fn test_artifact_name_template() {
        let section = ArtifactSection::default();
        assert_eq!(section.name_for("1.85.74"), "1.85.74");
        let section = ArtifactSection {
            name: "brave-{version}-linux".into(),
            ..Default::default()
        };
        assert_eq!(section.name_for("1.85.74"), "brave-1.85.74-linux");
        assert_eq!(section.name_for("1.85.74+1"), "brave-1.85.74_1-linux");
        assert_eq!(ArtifactSection::default().name_for("1.85.74+linux"), "1.85.74_linux");
        assert_eq!(ArtifactSection::default().name_for(".."), "___");
    }

    #[test]
    fn test_huge_minutes_saturate() {
        let job = JobSection {
            ceiling_minutes: u64::MAX,
            floor_minutes: u64::MAX / 2,
            ..Default::default()
        };
        assert_eq!(job.ceiling(), Duration::from_secs(u64::MAX));
        assert_eq!(job.floor(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_validate_reports_missing_build_and_store() {
        let problems = BatonToml::default().validate();
        assert!(problems.iter().any(|p| p.contains("stages.build.command")));
        assert!(problems.iter().any(|p| p.contains("transport.dir")));
    }

    #[test]
    fn test_validate_floor_above_ceiling() {
        let mut config = BatonToml::parse(DEFAULT_TEMPLATE).unwrap();
        config.job.floor_minutes = 300;
        let problems = config.validate();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("floor_minutes"));
    }

    #[test]
    fn test_validate_zero_attempts() {
        let mut config = BatonToml::parse(DEFAULT_TEMPLATE).unwrap();
        config.transport.attempts = 0;
        assert!(config.validate().iter().any(|p| p.contains("attempts")));
    }

    #[test]
    fn test_validate_http_requires_url() {
        let mut config = BatonToml::parse(DEFAULT_TEMPLATE).unwrap();
        config.transport.backend = StoreBackend::Http;
        assert!(config.validate().iter().any(|p| p.contains("transport.url")));
    }

    #[test]
    fn test_env_store_dir_selects_dir_backend() {
        let mut config = BatonToml::default();
        config.transport.backend = StoreBackend::Http;
        config.apply_env(env(&[(ENV_STORE_DIR, "/mnt/store")]));
        assert_eq!(config.transport.backend, StoreBackend::Dir);
        assert_eq!(config.transport.dir, Some(PathBuf::from("/mnt/store")));
    }

    #[test]
    fn test_env_store_url_selects_http_backend() {
        let mut config = BatonToml::default();
        config.apply_env(env(&[(ENV_STORE_URL, "https://store.example")]));
        assert_eq!(config.transport.backend, StoreBackend::Http);
        assert_eq!(config.transport.url.as_deref(), Some("https://store.example"));
    }

    #[test]
    fn test_github_output_is_only_a_fallback() {
        let mut config = BatonToml::default();
        config.apply_env(env(&[(ENV_GITHUB_OUTPUT, "/tmp/gh_out")]));
        assert_eq!(config.signal.output_file, Some(PathBuf::from("/tmp/gh_out")));

        let mut config = BatonToml::default();
        config.signal.output_file = Some(PathBuf::from("mine.txt"));
        config.apply_env(env(&[(ENV_GITHUB_OUTPUT, "/tmp/gh_out")]));
        assert_eq!(config.signal.output_file, Some(PathBuf::from("mine.txt")));
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = BatonToml::default();
        config.apply_env(env(&[(ENV_STORE_DIR, "  ")]));
        assert!(config.transport.dir.is_none());
    }

    #[test]
    fn test_baton_toml_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baton.toml");
        let mut config = BatonToml::parse(DEFAULT_TEMPLATE).unwrap();
        config.job.settle_secs = 0;
        config.save(&path).unwrap();
        let loaded = BatonToml::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_baton_toml_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = BatonToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, BatonToml::default());
    }

    #[test]
    fn test_baton_toml_parse_invalid() {
        let err = BatonToml::parse("[job]\nceiling_minutes = \"soon\"").unwrap_err();
        assert!(err.to_string().contains("baton.toml"));
    }
}
