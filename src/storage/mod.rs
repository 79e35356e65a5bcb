//! Blob storage abstraction
//!
//! Uploaded images and prediction documents both end up in a [`StorageBackend`].
//! S3 is used in production, a local directory in development and an in-memory
//! map for throwaway runs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

pub mod local;
pub mod memory;
pub mod s3;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read object from storage
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Write object to storage, replacing any previous content under `key`
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()>;

    /// List every key below `prefix`, in the backend's natural order
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
    Local {
        root_path: String,
    },
    Memory,
}

/// Create storage backend from config
pub async fn create_storage(config: StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::S3 {
            bucket,
            region,
            endpoint,
        } => {
            tracing::info!(%bucket, %region, "Using S3 storage backend");
            let backend = s3::S3Storage::new(bucket, region, endpoint).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Local { root_path } => {
            tracing::info!(root = %root_path, "Using local storage backend");
            let backend = local::LocalStorage::new(root_path)?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => {
            tracing::warn!("Using in-memory storage backend; nothing survives a restart");
            Ok(Arc::new(memory::MemoryStorage::new()))
        }
    }
}
