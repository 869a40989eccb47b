//! Checkpoint and final-artifact archives.
//!
//! An archive bundles a list of entries (paths relative to a source root) into a
//! single compressed tar file. Restoring it under another root reproduces the
//! entries' contents, directory structure, permissions and modification times.

pub mod tar_codec;

pub use tar_codec::TarCodec;

use crate::errors::ArchiveError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Compression trade-off for an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionProfile {
    /// Fast general-purpose compression (checkpoints)
    #[default]
    Fast,
    /// Highest ratio (final artifacts)
    Best,
    /// Store only
    None,
}

impl CompressionProfile {
    pub fn level(self) -> flate2::Compression {
        match self {
            CompressionProfile::Fast => flate2::Compression::fast(),
            CompressionProfile::Best => flate2::Compression::best(),
            CompressionProfile::None => flate2::Compression::none(),
        }
    }
}

impl std::fmt::Display for CompressionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionProfile::Fast => write!(f, "fast"),
            CompressionProfile::Best => write!(f, "best"),
            CompressionProfile::None => write!(f, "none"),
        }
    }
}

/// Summary of a created archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub path: PathBuf,
    pub entries: usize,
    pub bytes: u64,
}

/// Abstraction over archive creation and extraction, for testability.
/// Real implementation: `TarCodec`.
#[async_trait]
pub trait ArchiveCodec: Send + Sync {
    /// Bundle `entries` (relative to `source_root`) into the archive at `dest`.
    /// Entries missing on disk are skipped; if none exist the call fails.
    async fn create(
        &self,
        source_root: &Path,
        entries: &[PathBuf],
        dest: &Path,
        profile: CompressionProfile,
    ) -> Result<ArchiveReport, ArchiveError>;

    /// Extract `archive` under `dest_root`, overwriting existing files.
    async fn restore(&self, archive: &Path, dest_root: &Path) -> Result<(), ArchiveError>;
}
