//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{validate, Config, ConfigManager};
use crate::error::{ForgeError, ForgeResult};
use crate::ui::{self, UiContext};

/// Keys accepted by `config set`
const KEYS: &[&str] = &[
    "general.log_level",
    "general.log_format",
    "general.audit_log",
    "limits.max_image_size_mb",
    "limits.max_megapixels",
    "limits.allow_upsampling",
    "jobs.max_concurrent_jobs",
    "jobs.processing_timeout_ms",
    "cache.enabled",
    "cache.max_size_mb",
    "cache.ttl_seconds",
    "storage.type",
    "storage.path",
    "storage.s3.bucket",
    "storage.s3.region",
    "storage.s3.endpoint",
    "ingest.url_enabled",
    "ingest.allowed_domains",
    "ingest.ssrf_protection",
    "ingest.fetch_timeout_ms",
    "ingest.max_redirects",
];

/// Execute the config command
///
/// `show` reads the effective configuration; the other actions work on the
/// file alone so a broken environment cannot block fixing it.
pub async fn execute(args: ConfigArgs, manager: &ConfigManager) -> ForgeResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(&manager.load_effective().await?)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, &key, &value).await?,
    }
    Ok(())
}

fn show_config(config: &Config) -> ForgeResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> ForgeResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(
        &ctx,
        "Configuration initialized",
        &path.display().to_string(),
    );
    Ok(())
}

async fn set_value(manager: &ConfigManager, key: &str, value: &str) -> ForgeResult<()> {
    let ctx = UiContext::detect();

    if !KEYS.contains(&key) {
        ui::step_error_detail(&ctx, "Unknown config key", key);
        ui::remark(&ctx, "Valid keys:");
        for key in KEYS {
            eprintln!("  {}", key);
        }
        return Err(ForgeError::User(format!("Unknown config key: {}", key)));
    }

    // Edit the TOML tree, then round-trip through the schema so type errors
    // surface before anything is written.
    let mut doc = toml::Value::try_from(manager.load().await?)?;
    set_toml_value(&mut doc, key, value)?;
    let config: Config = doc.try_into().map_err(|e: toml::de::Error| ForgeError::ConfigValue {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    validate(&config)?;

    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));
    Ok(())
}

/// Set a dot-separated key in a TOML value tree, creating intermediate tables
/// as needed
fn set_toml_value(doc: &mut toml::Value, key: &str, value: &str) -> ForgeResult<()> {
    let (path, leaf) = match key.rsplit_once('.') {
        Some((path, leaf)) => (Some(path), leaf),
        None => (None, key),
    };

    let mut current = doc;
    for part in path.into_iter().flat_map(|p| p.split('.')) {
        current = current
            .as_table_mut()
            .ok_or_else(|| ForgeError::User(format!("Expected table at key: {}", part)))?
            .entry(part)
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    let table = current
        .as_table_mut()
        .ok_or_else(|| ForgeError::User(format!("Expected table for key: {}", key)))?;

    let toml_value = if key == "ingest.allowed_domains" {
        toml::Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        )
    } else if let Ok(b) = value.parse::<bool>() {
        toml::Value::Boolean(b)
    } else if let Ok(n) = value.parse::<i64>() {
        toml::Value::Integer(n)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    };

    table.insert(leaf.to_string(), toml_value);
    Ok(())
}
