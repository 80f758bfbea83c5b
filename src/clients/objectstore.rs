//! Object-store client backing the two-tier TTS cache (spec.md §4.7).

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("object store upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("object store io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        cache_control: &str,
    ) -> Result<(), ObjectStoreError>;
}

/// S3-compatible object store accessed over plain HTTP PUT/GET, matching
/// the "bucket name" env var in spec.md §6.
pub struct HttpObjectStore {
    http: reqwest::Client,
    endpoint_base: String,
}

impl HttpObjectStore {
    pub fn new(http: reqwest::Client, endpoint_base: String) -> Self {
        Self { http, endpoint_base }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let resp = self
            .http
            .get(format!("{}/{}/{}", self.endpoint_base, bucket, key))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        cache_control: &str,
    ) -> Result<(), ObjectStoreError> {
        let resp = self
            .http
            .put(format!("{}/{}/{}", self.endpoint_base, bucket, key))
            .header("Cache-Control", cache_control)
            .body(bytes)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Filesystem-backed stub used by tests, the simulator, and any deployment
/// without a real object-store endpoint configured.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let path = self.path_for(bucket, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _cache_control: &str,
    ) -> Result<(), ObjectStoreError> {
        let path = self.path_for(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf());

        assert!(store.get("bucket", "missing.ulaw").await.unwrap().is_none());

        store
            .put("bucket", "greeting.ulaw", vec![1, 2, 3], "max-age=31536000")
            .await
            .unwrap();
        let got = store.get("bucket", "greeting.ulaw").await.unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));
    }
}
