//! Blob storage for processed outputs
//!
//! Provides one capability interface over two backends:
//! - Local filesystem rooted at `STORAGE_PATH`
//! - S3-compatible object store (AWS, MinIO, R2, ...)
//!
//! The backend is chosen once at startup by [`create_backend`].

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::S3Storage;

use crate::config::schema::{StorageConfig, StorageType};
use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One stored blob as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Abstract blob store
///
/// Implementations must be safe for concurrent use and must report a missing
/// key as [`ForgeError::NotFound`] from both `get` and `delete`. Every other
/// failure is a [`ForgeError::Storage`] carrying the backend cause.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store bytes under a key, replacing any previous content
    async fn put(&self, key: &str, bytes: Bytes) -> ForgeResult<()>;

    /// Read the bytes stored under a key
    async fn get(&self, key: &str) -> ForgeResult<Bytes>;

    /// Remove a key
    async fn delete(&self, key: &str) -> ForgeResult<()>;

    /// Every key under a prefix, in no particular order
    async fn list(&self, prefix: &str) -> ForgeResult<Vec<StoredObject>>;

    /// Check that the backend is reachable and writable
    async fn health_check(&self) -> ForgeResult<()>;

    /// Backend name for logs and probes
    fn backend_name(&self) -> &'static str;
}

/// Create the configured storage backend
pub async fn create_backend(config: &StorageConfig) -> ForgeResult<Arc<dyn StorageBackend>> {
    match config.storage_type {
        StorageType::Local => Ok(Arc::new(LocalStorage::new(config.path.clone()).await?)),
        StorageType::S3 => Ok(Arc::new(S3Storage::new(&config.s3).await?)),
    }
}

/// Validate a storage key
///
/// Keys are relative, slash-separated paths of `[A-Za-z0-9._-]` segments.
/// Empty segments and `.`/`..` are rejected so a key can never escape the
/// local root or alias another key.
pub fn validate_key(key: &str) -> ForgeResult<()> {
    if key.is_empty() || key.len() > 512 {
        return Err(ForgeError::InvalidKey(key.to_string()));
    }
    for segment in key.split('/') {
        let valid_chars = segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if segment.is_empty() || segment == "." || segment == ".." || !valid_chars {
            return Err(ForgeError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}
