//! Configuration schema for imgforge
//!
//! Configuration is stored at `~/.config/imgforge/config.toml` and can be
//! overridden by the process environment (see [`super::env`]).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Input size limits
    pub limits: LimitsConfig,

    /// Job engine settings
    pub jobs: JobsConfig,

    /// Result cache settings
    pub cache: CacheConfig,

    /// Storage backend settings
    pub storage: StorageConfig,

    /// URL ingestion and SSRF settings
    pub ingest: IngestConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: debug, info, warn, error
    pub log_level: String,

    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging of security events
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Input image limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum accepted payload in MB
    pub max_image_size_mb: f64,

    /// Maximum decoded size in megapixels
    pub max_megapixels: f64,

    /// Allow resize targets larger than the source
    pub allow_upsampling: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_image_size_mb: 50.0,
            max_megapixels: 100.0,
            allow_upsampling: false,
        }
    }
}

impl LimitsConfig {
    /// Payload limit in bytes
    pub fn max_image_bytes(&self) -> u64 {
        (self.max_image_size_mb * MB as f64) as u64
    }

    /// Pixel limit as an absolute count
    pub fn max_pixels(&self) -> u64 {
        (self.max_megapixels * 1_000_000.0) as u64
    }
}

/// Job engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Number of worker slots
    pub max_concurrent_jobs: usize,

    /// Per-job transform timeout in milliseconds
    pub processing_timeout_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            processing_timeout_ms: 30_000,
        }
    }
}

impl JobsConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the result cache (default: true)
    pub enabled: bool,

    /// Total size budget in MB
    pub max_size_mb: f64,

    /// Entry time-to-live in seconds
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 1000.0,
            ttl_seconds: 2_592_000,
        }
    }
}

impl CacheConfig {
    /// Size budget in bytes
    pub fn max_size_bytes(&self) -> u64 {
        (self.max_size_mb * MB as f64) as u64
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Local,
    S3,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend: "local" or "s3"
    #[serde(rename = "type")]
    pub storage_type: StorageType,

    /// Root directory for the local backend
    pub path: PathBuf,

    /// S3-compatible backend settings
    pub s3: S3Config,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Local,
            path: PathBuf::from("./data"),
            s3: S3Config::default(),
        }
    }
}

/// S3-compatible object store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    /// Custom endpoint for MinIO, R2, etc.
    pub endpoint: Option<String>,
}

/// URL ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Allow fetching inputs from remote URLs
    pub url_enabled: bool,

    /// Domains exempt from SSRF address checks (subdomains included)
    pub allowed_domains: Vec<String>,

    /// Reject URLs resolving to internal addresses
    pub ssrf_protection: bool,

    /// Whole-request timeout for remote fetches in milliseconds
    pub fetch_timeout_ms: u64,

    /// Maximum redirects followed per fetch
    pub max_redirects: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            url_enabled: true,
            allowed_domains: vec![],
            ssrf_protection: true,
            fetch_timeout_ms: 10_000,
            max_redirects: 5,
        }
    }
}

impl IngestConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
