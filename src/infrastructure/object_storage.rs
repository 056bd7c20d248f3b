//! 对象存储 - 基础设施层
//!
//! 接收二进制数据和路径，返回可长期访问的地址。

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// 上传数据，返回引用地址
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String>;
}

/// 本地目录存储
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url,
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(StorageError::upload_failed(path, "路径中不能包含 .."));
        }

        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| StorageError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        fs::write(&target, &bytes).await.map_err(|e| StorageError::Io {
            path: target.display().to_string(),
            source: e,
        })?;

        debug!(
            "媒体已写入本地存储: {} ({} 字节, {})",
            target.display(),
            bytes.len(),
            content_type
        );

        Ok(match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), relative),
            None => format!("file://{}", target.display()),
        })
    }
}

/// HTTP 对象存储（PUT 上传）
pub struct HttpObjectStorage {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStorage {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
        }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(path, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::upload_failed(
                path,
                format!("HTTP {}", status.as_u16()),
            ));
        }

        debug!("媒体已上传: {}", url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_storage_writes_file_and_builds_url() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path(), Some("https://media.example.com/".into()));

        let url = storage
            .put("u1/s1/q0.webm", b"abc".to_vec(), "video/webm")
            .await
            .unwrap();

        assert_eq!(url, "https://media.example.com/u1/s1/q0.webm");
        assert_eq!(std::fs::read(dir.path().join("u1/s1/q0.webm")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_local_storage_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path(), None);
        assert!(storage
            .put("../escape.bin", vec![1], "application/octet-stream")
            .await
            .is_err());
    }
}
