//! S3-compatible storage backend
//!
//! Works against AWS S3 and any endpoint speaking the same API (MinIO, R2,
//! Ceph). When a custom endpoint is configured, path-style addressing is
//! used. The SDK client pools its connections and is shared by all callers.

use super::{validate_key, StorageBackend, StoredObject};
use crate::config::schema::S3Config;
use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use aws_sdk_s3::config::{Builder, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

const BACKEND: &str = "s3";

/// Object-store-backed blob store
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3Storage {
    /// Build a client from configuration
    ///
    /// Static credentials are used when both key id and secret are set;
    /// otherwise the SDK default provider chain applies.
    pub async fn new(config: &S3Config) -> ForgeResult<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| ForgeError::ConfigValue {
                key: "S3_BUCKET".to_string(),
                reason: "required when STORAGE_TYPE=s3".to_string(),
            })?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                id.clone(),
                secret.clone(),
                None,
                None,
                "imgforge-config",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        debug!("S3 storage using bucket {}", bucket);
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket,
        })
    }
}

/// Flatten an SDK error chain into a plain cause
fn sdk_cause<E: std::error::Error>(err: E) -> std::io::Error {
    std::io::Error::other(DisplayErrorContext(err).to_string())
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn put(&self, key: &str, bytes: Bytes) -> ForgeResult<()> {
        validate_key(key)?;
        let len = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ForgeError::storage(BACKEND, format!("putting {}", key), sdk_cause(e)))?;
        debug!("Stored s3://{}/{} ({} bytes)", self.bucket, key, len);
        Ok(())
    }

    async fn get(&self, key: &str) -> ForgeResult<Bytes> {
        validate_key(key)?;
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(ForgeError::NotFound(key.to_string()));
            }
            Err(e) => {
                return Err(ForgeError::storage(
                    BACKEND,
                    format!("getting {}", key),
                    sdk_cause(e),
                ))
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| ForgeError::storage(BACKEND, format!("reading {}", key), sdk_cause(e)))?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, key: &str) -> ForgeResult<()> {
        validate_key(key)?;
        // DeleteObject succeeds for absent keys, so probe first to keep the
        // NotFound contract identical to the local backend.
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                return Err(ForgeError::NotFound(key.to_string()));
            }
            Err(e) => {
                return Err(ForgeError::storage(
                    BACKEND,
                    format!("checking {}", key),
                    sdk_cause(e),
                ))
            }
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ForgeError::storage(BACKEND, format!("deleting {}", key), sdk_cause(e)))?;
        debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> ForgeResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    ForgeError::storage(BACKEND, format!("listing {}", prefix), sdk_cause(e))
                })?;

            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or_else(Utc::now);
                objects.push(StoredObject {
                    key: key.to_string(),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    modified,
                });
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        debug!(
            "Listed {} object(s) under s3://{}/{}",
            objects.len(),
            self.bucket,
            prefix
        );
        Ok(objects)
    }

    async fn health_check(&self) -> ForgeResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                ForgeError::storage(
                    BACKEND,
                    format!("reaching bucket {}", self.bucket),
                    sdk_cause(e),
                )
            })?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
