//! Local filesystem storage backend
//!
//! Blobs live under a root directory, one file per key. Writes go to a
//! temporary sibling first and are renamed into place so readers never see
//! a partially written blob.

use super::{validate_key, StorageBackend, StoredObject};
use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

const BACKEND: &str = "local";

/// Filesystem-backed blob store
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create the backend, creating the root directory if needed
    pub async fn new(root: PathBuf) -> ForgeResult<Self> {
        fs::create_dir_all(&root).await.map_err(|e| {
            ForgeError::storage(BACKEND, format!("creating root {}", root.display()), e)
        })?;
        debug!("Local storage rooted at {}", root.display());
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> ForgeResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Key for a file under the root; `None` for in-progress writes and
    /// anything that is not a valid key
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        let key = parts.join("/");
        let name = parts.last()?;
        if name.contains(".tmp-") || name.starts_with(".probe-") || validate_key(&key).is_err() {
            return None;
        }
        Some(key)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn put(&self, key: &str, bytes: Bytes) -> ForgeResult<()> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ForgeError::storage(BACKEND, format!("creating directory for {}", key), e)
            })?;
        }

        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&tmp, &bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ForgeError::storage(BACKEND, format!("writing {}", key), e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ForgeError::storage(BACKEND, format!("committing {}", key), e));
        }

        debug!("Stored {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> ForgeResult<Bytes> {
        let path = self.blob_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ForgeError::NotFound(key.to_string())),
            Err(e) => Err(ForgeError::storage(BACKEND, format!("reading {}", key), e)),
        }
    }

    async fn delete(&self, key: &str) -> ForgeResult<()> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}", key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ForgeError::NotFound(key.to_string())),
            Err(e) => Err(ForgeError::storage(BACKEND, format!("deleting {}", key), e)),
        }
    }

    async fn list(&self, prefix: &str) -> ForgeResult<Vec<StoredObject>> {
        let prefix = prefix.trim_end_matches('/');
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.blob_path(prefix)?
        };

        let mut objects = Vec::new();
        let mut dirs = vec![start];
        while let Some(dir) = dirs.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(ForgeError::storage(
                        BACKEND,
                        format!("listing {}", dir.display()),
                        e,
                    ))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ForgeError::storage(BACKEND, format!("listing {}", dir.display()), e))?
            {
                let path = entry.path();
                let metadata = entry.metadata().await.map_err(|e| {
                    ForgeError::storage(BACKEND, format!("inspecting {}", path.display()), e)
                })?;
                if metadata.is_dir() {
                    dirs.push(path);
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                objects.push(StoredObject {
                    key,
                    size_bytes: metadata.len(),
                    modified,
                });
            }
        }
        Ok(objects)
    }

    async fn health_check(&self) -> ForgeResult<()> {
        let probe = self.root.join(format!(".probe-{}", Uuid::new_v4().simple()));
        fs::write(&probe, b"ok")
            .await
            .map_err(|e| ForgeError::storage(BACKEND, "writing probe file", e))?;
        fs::remove_file(&probe)
            .await
            .map_err(|e| ForgeError::storage(BACKEND, "removing probe file", e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
