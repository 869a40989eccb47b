//! Remote artifact transport.
//!
//! [`RemoteStore`] is the backend seam (filesystem or HTTP); [`ArtifactTransport`]
//! layers the delivery rules on top of it:
//! - uploads are attempted a bounded number of times with a fixed delay
//! - deletes never fail the caller (the artifact may not exist yet)
//! - `publish` deletes the previous artifact of the same name before uploading,
//!   so at most one live artifact exists per name
//! - downloading a name that does not exist is a distinct, non-retried error

pub mod dir;
pub mod http;

pub use dir::DirStore;
pub use http::HttpStore;

use crate::errors::{StoreError, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One file inside an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the upload base directory, `/`-separated
    pub path: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the file contents
    pub sha256: String,
}

/// Manifest of an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: String,
    pub name: String,
    pub files: Vec<ArtifactFile>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub compression_level: u32,
}

impl ArtifactMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Per-upload options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub retention_days: u32,
    /// Transfer compression requested from the store; archives are already compressed
    pub compression_level: u32,
}

impl UploadOptions {
    pub fn retention(retention_days: u32) -> Self {
        Self {
            retention_days,
            compression_level: 0,
        }
    }
}

/// Abstraction over a remote blob store keyed by artifact name, for testability.
/// Real implementations: `DirStore`, `HttpStore`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Manifest of the live artifact registered under `name`, if any.
    async fn metadata(&self, name: &str) -> Result<Option<ArtifactMeta>, StoreError>;

    /// Fetch every file of `meta` into `dest`, verifying digests.
    async fn download(&self, meta: &ArtifactMeta, dest: &Path)
    -> Result<Vec<PathBuf>, StoreError>;

    /// Register `files` (relative to `base_dir`) under `name`.
    async fn upload(
        &self,
        name: &str,
        files: &[PathBuf],
        base_dir: &Path,
        options: &UploadOptions,
    ) -> Result<ArtifactMeta, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

pub struct ArtifactTransport {
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
}

impl ArtifactTransport {
    pub fn new(store: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Upload with bounded retries. No attempt is made after the last one fails.
    pub async fn upload(
        &self,
        name: &str,
        files: &[PathBuf],
        base_dir: &Path,
        options: &UploadOptions,
    ) -> Result<ArtifactMeta, TransportError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.upload(name, files, base_dir, options).await {
                Ok(meta) => {
                    info!(
                        artifact = name,
                        id = %meta.id,
                        bytes = meta.total_size(),
                        attempt,
                        "Artifact uploaded"
                    );
                    return Ok(meta);
                }
                Err(e) if attempt >= attempts => {
                    warn!(artifact = name, attempt, error = %e, "Upload failed, giving up");
                    return Err(TransportError::Exhausted {
                        operation: "upload",
                        name: name.to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(
                        artifact = name,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Upload failed, retrying in {}s",
                        self.retry.delay.as_secs()
                    );
                    tokio::time::sleep(self.retry.delay).await;
                    // A live artifact still holds the name; clear it again before retrying.
                    if matches!(e, StoreError::Conflict(_)) {
                        self.delete(name).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Delete `name`, swallowing any failure. Returns whether the delete succeeded.
    pub async fn delete(&self, name: &str) -> bool {
        match self.store.delete(name).await {
            Ok(()) => {
                debug!(artifact = name, "Previous artifact deleted");
                true
            }
            Err(e) => {
                debug!(artifact = name, error = %e, "Delete failed (artifact may not exist)");
                false
            }
        }
    }

    /// Replace the artifact registered under `name`: delete, then upload.
    ///
    /// A failed delete does not block the upload: an upload rejected with
    /// `Conflict` retries the delete before its next attempt. If the delete
    /// succeeds and every upload attempt fails, no artifact exists under `name`
    /// until the next successful publish.
    pub async fn publish(
        &self,
        name: &str,
        files: &[PathBuf],
        base_dir: &Path,
        options: &UploadOptions,
    ) -> Result<ArtifactMeta, TransportError> {
        self.delete(name).await;
        self.upload(name, files, base_dir, options).await
    }

    /// Download the live artifact registered under `name` into `dest`.
    ///
    /// A missing artifact is reported immediately as [`TransportError::NotFound`];
    /// backend failures are retried like uploads.
    pub async fn download(&self, name: &str, dest: &Path) -> Result<Vec<PathBuf>, TransportError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match self.store.metadata(name).await {
                Ok(None) => {
                    return Err(TransportError::NotFound {
                        name: name.to_string(),
                    });
                }
                Ok(Some(meta)) => self
                    .store
                    .download(&meta, dest)
                    .await
                    .map(|files| (files, meta.total_size())),
                Err(e) => Err(e),
            };
            match result {
                Ok((files, bytes)) => {
                    info!(artifact = name, files = files.len(), bytes, attempt, "Artifact downloaded");
                    return Ok(files);
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(TransportError::NotFound {
                        name: name.to_string(),
                    });
                }
                Err(e) if attempt >= attempts => {
                    warn!(artifact = name, attempt, error = %e, "Download failed, giving up");
                    return Err(TransportError::Exhausted {
                        operation: "download",
                        name: name.to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    warn!(artifact = name, attempt, error = %e, "Download failed, retrying");
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Size and hex SHA-256 of a file.
pub fn digest_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, format!("{:x}", hasher.finalize())))
}

/// Artifact-relative path of `file`: relative to `base_dir` when inside it,
/// otherwise the bare file name.
pub fn relative_name(file: &Path, base_dir: &Path) -> String {
    let rel = file
        .strip_prefix(base_dir)
        .ok()
        .map(Path::to_path_buf)
        .or_else(|| file.file_name().map(PathBuf::from))
        .unwrap_or_else(|| file.to_path_buf());
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Map `raw` onto a valid artifact name, replacing every disallowed character
/// with `_`.
pub fn sanitize_name(raw: &str) -> String {
    let name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        name.replace('.', "_") + "_"
    } else {
        name
    }
}

/// Resolve a manifest file path under `dest`. Only plain relative paths are
/// accepted; absolute paths and `..` would escape the download directory.
pub fn contained_path(dest: &Path, path: &str) -> Result<PathBuf, StoreError> {
    let rel = Path::new(path);
    let plain = !path.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    if !plain {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("artifact file path '{}' escapes the destination", path),
        )));
    }
    Ok(dest.join(rel))
}

/// Artifact names become path segments and URL segments; keep them plain.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid artifact name '{}'", name),
        )))
    }
}
