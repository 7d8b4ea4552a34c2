//! Durable storage for extracted artifacts.

pub mod local;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::banner;
use crate::config::{UploaderConfig, UploaderKind};

pub use local::LocalUploader;
pub use s3::S3Uploader;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage configuration: {0}")]
    Config(String),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    ObjectStore(String),
}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Persists `data` under `unique_name` and returns where it ended up.
    ///
    /// Callers guarantee `unique_name` is a single path segment that is unique
    /// across requests.
    async fn store(&self, data: Bytes, unique_name: &str, mime_type: &str) -> Result<String, StorageError>;

    fn describe(&self) -> String;
}

pub async fn build_uploader(config: &UploaderConfig) -> Result<Arc<dyn Uploader>, StorageError> {
    let uploader: Arc<dyn Uploader> = match config.kind {
        UploaderKind::Local => Arc::new(LocalUploader::new(&config.local)?),
        UploaderKind::S3 => Arc::new(S3Uploader::new(&config.s3).await?),
    };
    banner::print_success(&format!("Uploader ready: {}", uploader.describe()));
    Ok(uploader)
}
