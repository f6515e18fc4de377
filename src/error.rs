//! Error types for imgforge
//!
//! All modules use `ForgeResult<T>` as their return type. `ForgeError` is
//! `Clone` so a single job failure can be delivered to every waiter on a
//! fingerprint unchanged.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for imgforge operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Boxed cause carried by infrastructure errors
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Coarse classification used by callers to map errors onto responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    SsrfBlocked,
    Fetch,
    Storage,
    NotFound,
    Timeout,
    Transform,
    Cancelled,
    Config,
    Internal,
}

/// All errors that can occur in imgforge
#[derive(Error, Debug, Clone)]
pub enum ForgeError {
    // Input errors
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Image too large: {megapixels:.2} MP exceeds limit of {limit} MP")]
    TooManyPixels { megapixels: f64, limit: f64 },

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("URL ingestion is disabled")]
    UrlIngestDisabled,

    // Security errors
    #[error("Blocked request to {host}: {reason}")]
    SsrfBlocked { host: String, reason: String },

    // Infrastructure errors
    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Storage error ({backend}): {context}")]
    Storage {
        backend: &'static str,
        context: String,
        #[source]
        source: Cause,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    // Job errors
    #[error("Job timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transform {transform} failed: {reason}")]
    Transform { transform: String, reason: String },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Output of {size} bytes does not fit cache budget of {budget} bytes")]
    CacheRejected { size: u64, budget: u64 },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    ConfigValue { key: String, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("TOML parse error: {0}")]
    TomlParse(Arc<toml::de::Error>),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(Arc<toml::ser::Error>),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl From<serde_json::Error> for ForgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(Arc::new(e))
    }
}

impl From<toml::de::Error> for ForgeError {
    fn from(e: toml::de::Error) -> Self {
        Self::TomlParse(Arc::new(e))
    }
}

impl From<toml::ser::Error> for ForgeError {
    fn from(e: toml::ser::Error) -> Self {
        Self::TomlSerialize(Arc::new(e))
    }
}

impl ForgeError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Create a storage error wrapping a backend-specific cause
    pub fn storage<E>(backend: &'static str, context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            backend,
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Create an SSRF block error
    pub fn ssrf(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SsrfBlocked {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a fetch error
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::PayloadTooLarge { .. }
            | Self::TooManyPixels { .. }
            | Self::UnsupportedFormat(_)
            | Self::UrlIngestDisabled
            | Self::InvalidKey(_) => ErrorKind::Validation,
            Self::SsrfBlocked { .. } => ErrorKind::SsrfBlocked,
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Storage { .. } | Self::Io { .. } | Self::CacheRejected { .. } => {
                ErrorKind::Storage
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transform { .. } => ErrorKind::Transform,
            Self::Cancelled | Self::ShuttingDown => ErrorKind::Cancelled,
            Self::ConfigInvalid { .. }
            | Self::ConfigValue { .. }
            | Self::ConfigDirCreate { .. }
            | Self::TomlParse(_)
            | Self::TomlSerialize(_) => ErrorKind::Config,
            Self::Json(_) | Self::Internal(_) | Self::User(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable by the transport layer
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fetch | ErrorKind::Storage)
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UrlIngestDisabled => Some("Set URL_INGEST_ENABLED=true or upload the file"),
            Self::SsrfBlocked { .. } => {
                Some("Add the domain to URL_INGEST_ALLOWED_DOMAINS if it is trusted")
            }
            Self::PayloadTooLarge { .. } => Some("Raise MAX_IMAGE_SIZE_MB or shrink the input"),
            Self::TooManyPixels { .. } => Some("Raise MAX_MEGAPIXELS or downscale the input"),
            Self::Timeout { .. } => Some("Raise PROCESSING_TIMEOUT_MS"),
            _ => None,
        }
    }
}
