//! Environment overlay
//!
//! Applies the deployment environment variables on top of a loaded
//! [`Config`]. Only the bootstrap path calls this; the engine receives the
//! finished configuration and never reads the environment itself.

use super::schema::{Config, StorageType};
use crate::error::{ForgeError, ForgeResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Apply recognised variables from `vars` onto `config`.
pub fn apply_env(config: &mut Config, vars: &HashMap<String, String>) -> ForgeResult<()> {
    let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    if let Some(v) = get("LOG_LEVEL") {
        config.general.log_level = v.to_lowercase();
    }

    if let Some(v) = get("MAX_IMAGE_SIZE_MB") {
        config.limits.max_image_size_mb = parse("MAX_IMAGE_SIZE_MB", v)?;
    }
    if let Some(v) = get("MAX_MEGAPIXELS") {
        config.limits.max_megapixels = parse("MAX_MEGAPIXELS", v)?;
    }
    if let Some(v) = get("ALLOW_UPSAMPLING") {
        config.limits.allow_upsampling = parse_flag(v);
    }

    if let Some(v) = get("MAX_CONCURRENT_JOBS") {
        config.jobs.max_concurrent_jobs = parse("MAX_CONCURRENT_JOBS", v)?;
    }
    if let Some(v) = get("PROCESSING_TIMEOUT_MS") {
        config.jobs.processing_timeout_ms = parse("PROCESSING_TIMEOUT_MS", v)?;
    }

    if let Some(v) = get("CACHE_ENABLED") {
        config.cache.enabled = parse_flag(v);
    }
    if let Some(v) = get("CACHE_MAX_SIZE_MB") {
        config.cache.max_size_mb = parse("CACHE_MAX_SIZE_MB", v)?;
    }
    if let Some(v) = get("CACHE_TTL_SECONDS") {
        config.cache.ttl_seconds = parse("CACHE_TTL_SECONDS", v)?;
    }

    if let Some(v) = get("STORAGE_TYPE") {
        config.storage.storage_type = match v {
            "local" => StorageType::Local,
            "s3" => StorageType::S3,
            other => {
                return Err(ForgeError::ConfigValue {
                    key: "STORAGE_TYPE".to_string(),
                    reason: format!("expected 'local' or 's3', got '{}'", other),
                })
            }
        };
    }
    if let Some(v) = get("STORAGE_PATH") {
        config.storage.path = PathBuf::from(v);
    }
    let s3 = &mut config.storage.s3;
    for (key, slot) in [
        ("S3_BUCKET", &mut s3.bucket),
        ("S3_REGION", &mut s3.region),
        ("S3_ACCESS_KEY_ID", &mut s3.access_key_id),
        ("S3_SECRET_ACCESS_KEY", &mut s3.secret_access_key),
        ("S3_ENDPOINT", &mut s3.endpoint),
    ] {
        if let Some(v) = get(key) {
            *slot = Some(v.to_string());
        }
    }

    if let Some(v) = get("URL_INGEST_ENABLED") {
        config.ingest.url_enabled = parse_flag(v);
    }
    if let Some(v) = get("URL_INGEST_ALLOWED_DOMAINS") {
        config.ingest.allowed_domains = v
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(v) = get("SSRF_PROTECTION_ENABLED") {
        config.ingest.ssrf_protection = parse_flag(v);
    }

    Ok(())
}

/// Boolean flags are true only for the literal string "true".
fn parse_flag(value: &str) -> bool {
    value == "true"
}

fn parse<T: FromStr>(key: &str, value: &str) -> ForgeResult<T> {
    value.parse().map_err(|_| ForgeError::ConfigValue {
        key: key.to_string(),
        reason: format!("cannot parse '{}'", value),
    })
}
