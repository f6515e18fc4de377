//! Input acquisition and validation
//!
//! Turns an upload or a remote URL into a [`RawImage`]: bytes within the
//! payload cap, a supported codec sniffed from magic bytes, and header
//! dimensions within the pixel cap. Remote fetches go through the SSRF guard.

mod fetch;
mod probe;
pub mod ssrf;

pub use fetch::{FetchedBody, HttpFetcher};
pub use probe::{mime_matches, probe};
pub use ssrf::{blocked_reason, HostResolver, SsrfGuard, SystemResolver};

use crate::audit::{events, AuditLog};
use crate::config::schema::{IngestConfig, LimitsConfig};
use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::ContentHash;
use crate::transform::ImageInfo;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a job's input comes from
#[derive(Clone)]
pub enum InputSource {
    Upload {
        bytes: Bytes,
        declared_mime: Option<String>,
    },
    Url(String),
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload {
                bytes,
                declared_mime,
            } => f
                .debug_struct("Upload")
                .field("len", &bytes.len())
                .field("declared_mime", declared_mime)
                .finish(),
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
        }
    }
}

/// Validated input image
#[derive(Debug, Clone)]
pub struct RawImage {
    pub bytes: Bytes,
    pub info: ImageInfo,
    pub declared_mime: Option<String>,
    pub content_hash: ContentHash,
}

/// Resolves and validates job inputs
pub struct Ingestor {
    max_bytes: u64,
    max_pixels: u64,
    fetcher: Option<HttpFetcher>,
    audit: Arc<AuditLog>,
}

impl Ingestor {
    /// Build an ingestor resolving names through the operating system
    pub fn new(limits: &LimitsConfig, ingest: &IngestConfig, audit: Arc<AuditLog>) -> ForgeResult<Self> {
        Self::with_resolver(limits, ingest, audit, Arc::new(SystemResolver))
    }

    /// Build an ingestor with a custom resolver
    pub fn with_resolver(
        limits: &LimitsConfig,
        ingest: &IngestConfig,
        audit: Arc<AuditLog>,
        resolver: Arc<dyn HostResolver>,
    ) -> ForgeResult<Self> {
        let max_bytes = limits.max_image_bytes();
        let fetcher = if ingest.url_enabled {
            let guard = SsrfGuard::new(
                ingest.ssrf_protection,
                ingest.allowed_domains.clone(),
                resolver,
            );
            Some(HttpFetcher::new(
                Arc::new(guard),
                max_bytes,
                ingest.fetch_timeout(),
                ingest.max_redirects,
            )?)
        } else {
            None
        };

        Ok(Self {
            max_bytes,
            max_pixels: limits.max_pixels(),
            fetcher,
            audit,
        })
    }

    pub fn url_enabled(&self) -> bool {
        self.fetcher.is_some()
    }

    /// Resolve any input source
    pub async fn ingest(&self, source: InputSource) -> ForgeResult<RawImage> {
        match source {
            InputSource::Upload {
                bytes,
                declared_mime,
            } => self.ingest_upload(bytes, declared_mime),
            InputSource::Url(url) => self.fetch_url(&url).await,
        }
    }

    /// Validate uploaded bytes
    ///
    /// Synchronous: only the header is parsed.
    pub fn ingest_upload(&self, bytes: Bytes, declared_mime: Option<String>) -> ForgeResult<RawImage> {
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(ForgeError::PayloadTooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        let info = probe(&bytes, self.max_pixels)?;
        if let Some(declared) = &declared_mime {
            if !mime_matches(declared, info.format) {
                debug!(
                    "Declared type {} differs from sniffed {}; using sniffed",
                    declared, info.format
                );
            }
        }

        Ok(RawImage {
            content_hash: ContentHash::of(&bytes),
            bytes,
            info,
            declared_mime,
        })
    }

    /// Fetch and validate a remote image
    pub async fn fetch_url(&self, url: &str) -> ForgeResult<RawImage> {
        let fetcher = self.fetcher.as_ref().ok_or(ForgeError::UrlIngestDisabled)?;

        let body = match fetcher.fetch(url).await {
            Ok(body) => body,
            Err(ForgeError::SsrfBlocked { host, reason }) => {
                self.audit
                    .log(
                        events::SSRF_BLOCKED,
                        &serde_json::json!({
                            "url": url,
                            "host": host,
                            "reason": reason,
                        }),
                    )
                    .await;
                return Err(ForgeError::SsrfBlocked { host, reason });
            }
            Err(e) => return Err(e),
        };

        let image = self.ingest_upload(body.bytes, body.content_type)?;
        info!(
            "Fetched {} ({}x{} {})",
            body.final_url, image.info.width, image.info.height, image.info.format
        );
        self.audit
            .log(
                events::URL_FETCHED,
                &serde_json::json!({
                    "url": url,
                    "final_url": body.final_url,
                    "bytes": image.bytes.len(),
                    "content_hash": image.content_hash.to_hex(),
                }),
            )
            .await;
        Ok(image)
    }
}
