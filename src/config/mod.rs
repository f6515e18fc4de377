//! Configuration management for imgforge

pub mod env;
pub mod schema;

pub use schema::Config;

use crate::error::{ForgeError, ForgeResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imgforge")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imgforge")
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> ForgeResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> ForgeResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ForgeError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| ForgeError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load the file, overlay the process environment and validate.
    pub async fn load_effective(&self) -> ForgeResult<Config> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        self.load_with_env(&vars).await
    }

    /// Same as [`Self::load_effective`] with an explicit variable map
    pub async fn load_with_env(&self, vars: &HashMap<String, String>) -> ForgeResult<Config> {
        let mut config = self.load().await?;
        env::apply_env(&mut config, vars)?;
        validate(&config)?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> ForgeResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            ForgeError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> ForgeResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ForgeError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: Arc::new(e),
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject configurations the engine cannot run with
pub fn validate(config: &Config) -> ForgeResult<()> {
    fn invalid(key: &str, reason: &str) -> ForgeError {
        ForgeError::ConfigValue {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    if !(config.limits.max_image_size_mb > 0.0) {
        return Err(invalid("MAX_IMAGE_SIZE_MB", "must be positive"));
    }
    if !(config.limits.max_megapixels > 0.0) {
        return Err(invalid("MAX_MEGAPIXELS", "must be positive"));
    }
    if config.jobs.max_concurrent_jobs == 0 {
        return Err(invalid("MAX_CONCURRENT_JOBS", "must be at least 1"));
    }
    if config.jobs.processing_timeout_ms == 0 {
        return Err(invalid("PROCESSING_TIMEOUT_MS", "must be positive"));
    }
    if !(config.cache.max_size_mb > 0.0) {
        return Err(invalid("CACHE_MAX_SIZE_MB", "must be positive"));
    }
    if config.cache.ttl_seconds == 0 {
        return Err(invalid("CACHE_TTL_SECONDS", "must be positive"));
    }
    if !matches!(
        config.general.log_level.as_str(),
        "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid("LOG_LEVEL", "expected debug, info, warn or error"));
    }
    if config.storage.storage_type == schema::StorageType::S3 && config.storage.s3.bucket.is_none()
    {
        return Err(invalid("S3_BUCKET", "required when STORAGE_TYPE=s3"));
    }
    Ok(())
}
