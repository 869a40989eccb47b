//! HTTP-backed store.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET|PUT|DELETE {base}/artifacts/{name}` for manifests (404 means absent)
//! - `GET|PUT {base}/blobs/{id}/{path}` for file contents
//!
//! Requests carry `Authorization: Bearer <token>` when a token is configured.

use super::{
    ArtifactFile, ArtifactMeta, RemoteStore, UploadOptions, contained_path, digest_file, relative_name,
    validate_name,
};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const USER_AGENT: &str = concat!("baton/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
            token,
        }
    }

    fn artifact_url(&self, name: &str) -> String {
        format!("{}/artifacts/{}", self.base_url, name)
    }

    fn blob_url(&self, id: &str, path: &str) -> String {
        format!("{}/blobs/{}/{}", self.base_url, id, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header("User-Agent", USER_AGENT);
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn put_blob(&self, id: &str, path: &str, file: &Path, size: u64) -> Result<(), StoreError> {
        let url = self.blob_url(id, path);
        let body = tokio::fs::File::open(file).await?;
        let resp = self
            .authorized(self.client.put(&url))
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", size)
            .body(body)
            .send()
            .await?;
        check(resp, &url)?;
        debug!(url = %url, bytes = size, "Blob uploaded");
        Ok(())
    }

    async fn get_blob(&self, id: &str, file: &ArtifactFile, dest: &Path) -> Result<PathBuf, StoreError> {
        let target = contained_path(dest, &file.path)?;
        let url = self.blob_url(id, &file.path);
        let resp = self.authorized(self.client.get(&url)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(file.path.clone()));
        }
        let resp = check(resp, &url)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(&target).await?;
        let mut hasher = Sha256::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        let actual = format!("{:x}", hasher.finalize());
        if actual != file.sha256 {
            return Err(StoreError::Integrity {
                path: file.path.clone(),
                expected: file.sha256.clone(),
                actual,
            });
        }
        Ok(target)
    }
}

fn check(resp: Response, url: &str) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(StoreError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn metadata(&self, name: &str) -> Result<Option<ArtifactMeta>, StoreError> {
        validate_name(name)?;
        let url = self.artifact_url(name);
        let resp = self.authorized(self.client.get(&url)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = check(resp, &url)?.text().await?;
        let meta: ArtifactMeta = serde_json::from_str(&body)?;
        if meta.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(meta))
    }

    async fn download(&self, meta: &ArtifactMeta, dest: &Path) -> Result<Vec<PathBuf>, StoreError> {
        tokio::fs::create_dir_all(dest).await?;
        let mut out = Vec::with_capacity(meta.files.len());
        for file in &meta.files {
            out.push(self.get_blob(&meta.id, file, dest).await?);
        }
        Ok(out)
    }

    async fn upload(
        &self,
        name: &str,
        files: &[PathBuf],
        base_dir: &Path,
        options: &UploadOptions,
    ) -> Result<ArtifactMeta, StoreError> {
        validate_name(name)?;
        let id = uuid::Uuid::new_v4().to_string();
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let path = relative_name(file, base_dir);
            let digest_path = file.clone();
            let (size, sha256) = tokio::task::spawn_blocking(move || digest_file(&digest_path))
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))??;
            self.put_blob(&id, &path, file, size).await?;
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
        let url = self.artifact_url(name);
        let resp = self
            .authorized(self.client.put(&url))
            .header("Content-Type", "application/json")
            .body(serde_json::to_vec(&meta)?)
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(StoreError::Conflict(name.to_string()));
        }
        check(resp, &url)?;
        Ok(meta)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        validate_name(name)?;
        let url = self.artifact_url(name);
        let resp = self.authorized(self.client.delete(&url)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(name.to_string()));
        }
        check(resp, &url)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_strip_trailing_slash() {
        let store = HttpStore::new("https://store.example/api/", None);
        assert_eq!(
            store.artifact_url("checkpoint"),
            "https://store.example/api/artifacts/checkpoint"
        );
        assert_eq!(
            store.blob_url("abc", "checkpoint.tar.gz"),
            "https://store.example/api/blobs/abc/checkpoint.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_request() {
        let store = HttpStore::new("http://127.0.0.1:1", None);
        let err = store.metadata("a/b").await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_http_error() {
        let store = HttpStore::new("http://127.0.0.1:1", Some("t0ken".into()));
        let err = store.metadata("checkpoint").await.unwrap_err();
        assert!(matches!(err, StoreError::Http(_)));
    }
}
