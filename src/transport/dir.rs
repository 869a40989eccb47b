//! Filesystem-backed store.
//!
//! Layout under the store root:
//! ```text
//! <root>/<name>/manifest.json
//! <root>/<name>/<id>/<file path>
//! ```
//! The manifest is written last (via rename), so an artifact only becomes
//! visible once all of its blobs are in place.

use super::{
    ArtifactFile, ArtifactMeta, RemoteStore, UploadOptions, contained_path, digest_file, relative_name,
    validate_name,
};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_manifest(&self, name: &str) -> Result<Option<ArtifactMeta>, StoreError> {
        validate_name(name)?;
        let path = self.artifact_dir(name).join(MANIFEST_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: ArtifactMeta = serde_json::from_str(&content)?;
        if meta.is_expired(Utc::now()) {
            debug!(artifact = name, expired_at = %meta.expires_at, "Ignoring expired artifact");
            return Ok(None);
        }
        Ok(Some(meta))
    }

    fn download_blocking(&self, meta: &ArtifactMeta, dest: &Path) -> Result<Vec<PathBuf>, StoreError> {
        validate_name(&meta.name)?;
        validate_name(&meta.id)?;
        let blob_dir = self.artifact_dir(&meta.name).join(&meta.id);
        if !blob_dir.is_dir() {
            return Err(StoreError::NotFound(meta.name.clone()));
        }
        fs::create_dir_all(dest)?;
        let mut out = Vec::with_capacity(meta.files.len());
        for file in &meta.files {
            let source = contained_path(&blob_dir, &file.path)?;
            let target = contained_path(dest, &file.path)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &target)?;
            let (_, actual) = digest_file(&target)?;
            if actual != file.sha256 {
                return Err(StoreError::Integrity {
                    path: file.path.clone(),
                    expected: file.sha256.clone(),
                    actual,
                });
            }
            out.push(target);
        }
        Ok(out)
    }

    fn upload_blocking(
        &self,
        name: &str,
        files: &[PathBuf],
        base_dir: &Path,
        options: &UploadOptions,
    ) -> Result<ArtifactMeta, StoreError> {
        if self.read_manifest(name)?.is_some() {
            return Err(StoreError::Conflict(name.to_string()));
        }
        let dir = self.artifact_dir(name);
        // Expired or partially written leftovers
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let blob_dir = dir.join(&id);
        fs::create_dir_all(&blob_dir)?;

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let path = relative_name(file, base_dir);
            let target = blob_dir.join(&path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(file, &target)?;
            let (size, sha256) = digest_file(&target)?;
            entries.push(ArtifactFile { path, size, sha256 });
        }

        let now = Utc::now();
        let meta = ArtifactMeta {
            id,
            name: name.to_string(),
            files: entries,
            created_at: now,
            expires_at: now + chrono::Duration::days(options.retention_days as i64),
            compression_level: options.compression_level,
        };
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(&meta)?)?;
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        Ok(meta)
    }

    fn delete_blocking(&self, name: &str) -> Result<(), StoreError> {
        validate_name(name)?;
        let dir = self.artifact_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?
}

#[async_trait]
impl RemoteStore for DirStore {
    async fn metadata(&self, name: &str) -> Result<Option<ArtifactMeta>, StoreError> {
        let store = self.clone();
        let name = name.to_string();
        blocking(move || store.read_manifest(&name)).await
    }

    async fn download(&self, meta: &ArtifactMeta, dest: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let store = self.clone();
        let meta = meta.clone();
        let dest = dest.to_path_buf();
        blocking(move || store.download_blocking(&meta, &dest)).await
    }

    async fn upload(
        &self,
        name: &str,
        files: &[PathBuf],
        base_dir: &Path,
        options: &UploadOptions,
    ) -> Result<ArtifactMeta, StoreError> {
        let store = self.clone();
        let name = name.to_string();
        let files = files.to_vec();
        let base_dir = base_dir.to_path_buf();
        let options = *options;
        blocking(move || store.upload_blocking(&name, &files, &base_dir, &options)).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let store = self.clone();
        let name = name.to_string();
        blocking(move || store.delete_blocking(&name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stage_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let store_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let store = DirStore::new(store_dir.path());
        let file = stage_file(work.path(), "checkpoint.tar.gz", b"tarball");

        let meta = store
            .upload("checkpoint", &[file], work.path(), &UploadOptions::retention(1))
            .await
            .unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].size, 7);

        let found = store.metadata("checkpoint").await.unwrap().unwrap();
        assert_eq!(found, meta);

        let dest = tempdir().unwrap();
        let files = store.download(&found, dest.path()).await.unwrap();
        assert_eq!(fs::read(&files[0]).unwrap(), b"tarball");
    }

    #[tokio::test]
    async fn test_missing_artifact_has_no_metadata() {
        let store_dir = tempdir().unwrap();
        let store = DirStore::new(store_dir.path());
        assert!(store.metadata("checkpoint").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upload_conflicts_with_live_artifact() {
        let store_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let store = DirStore::new(store_dir.path());
        let file = stage_file(work.path(), "a.tar.gz", b"one");
        store
            .upload("checkpoint", &[file.clone()], work.path(), &UploadOptions::retention(1))
            .await
            .unwrap();
        let err = store
            .upload("checkpoint", &[file], work.path(), &UploadOptions::retention(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_expired_artifact_is_invisible_and_replaceable() {
        let store_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let store = DirStore::new(store_dir.path());
        let file = stage_file(work.path(), "a.tar.gz", b"one");
        store
            .upload("checkpoint", &[file.clone()], work.path(), &UploadOptions::retention(0))
            .await
            .unwrap();
        assert!(store.metadata("checkpoint").await.unwrap().is_none());
        store
            .upload("checkpoint", &[file], work.path(), &UploadOptions::retention(1))
            .await
            .unwrap();
        assert!(store.metadata("checkpoint").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_artifact() {
        let store_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let store = DirStore::new(store_dir.path());
        let file = stage_file(work.path(), "a.tar.gz", b"one");
        store
            .upload("checkpoint", &[file], work.path(), &UploadOptions::retention(1))
            .await
            .unwrap();
        store.delete("checkpoint").await.unwrap();
        assert!(store.metadata("checkpoint").await.unwrap().is_none());
        let err = store.delete("checkpoint").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_download_detects_tampered_blob() {
        let store_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let store = DirStore::new(store_dir.path());
        let file = stage_file(work.path(), "a.tar.gz", b"original");
        let meta = store
            .upload("checkpoint", &[file], work.path(), &UploadOptions::retention(1))
            .await
            .unwrap();
        fs::write(
            store_dir.path().join("checkpoint").join(&meta.id).join("a.tar.gz"),
            b"tampered",
        )
        .unwrap();

        let dest = tempdir().unwrap();
        let err = store.download(&meta, dest.path()).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_download_rejects_escaping_manifest_path() {
        let store_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let store = DirStore::new(store_dir.path());
        let file = stage_file(work.path(), "a.tar.gz", b"payload");
        let mut meta = store
            .upload("checkpoint", &[file], work.path(), &UploadOptions::retention(1))
            .await
            .unwrap();
        meta.files[0].path = "../outside.tar.gz".to_string();

        let parent = tempdir().unwrap();
        let dest = parent.path().join("restore");
        let err = store.download(&meta, &dest).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(!parent.path().join("outside.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let store_dir = tempdir().unwrap();
        let store = DirStore::new(store_dir.path());
        assert!(store.metadata("../escape").await.is_err());
    }
}
