use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use super::{StorageError, Uploader};
use crate::config::LocalUploaderConfig;

/// Writes artifacts into one directory on the local filesystem.
pub struct LocalUploader {
    destination: PathBuf,
}

impl LocalUploader {
    pub fn new(config: &LocalUploaderConfig) -> Result<Self, StorageError> {
        if config.path.trim().is_empty() {
            return Err(StorageError::Config("local storage path must not be empty".into()));
        }
        Ok(Self {
            destination: PathBuf::from(&config.path),
        })
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    async fn store(&self, data: Bytes, unique_name: &str, _mime_type: &str) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(&self.destination).await?;

        let full_path = self.destination.join(unique_name);
        // create_new: a collision means the caller broke the uniqueness contract
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;

        Ok(full_path.display().to_string())
    }

    fn describe(&self) -> String {
        format!("local directory {}", self.destination.display())
    }
}
