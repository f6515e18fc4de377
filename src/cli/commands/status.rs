//! Status command - liveness and readiness probe

use crate::audit::AuditLog;
use crate::cache::{format_bytes, CacheSizeStatus};
use crate::cli::args::StatusArgs;
use crate::config::Config;
use crate::engine::JobEngine;
use crate::error::{ForgeError, ForgeResult};
use crate::health::{self, CheckStatus, HealthReport};
use crate::ui::{self, TaskSpinner, UiContext};
use std::sync::Arc;

/// Execute the status command
pub async fn execute(args: StatusArgs, config: &Config) -> ForgeResult<()> {
    let ctx = UiContext::detect().with_quiet(args.json);
    let engine = JobEngine::from_config(config, Arc::new(AuditLog::new(config))).await?;

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Probing storage...");
    let report = health::report(&engine).await;
    if report.ready {
        spinner.stop("Probes finished");
    } else {
        spinner.stop_error("Probes finished with failures");
    }
    engine.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&ctx, config, &report);
    }

    if report.ready {
        Ok(())
    } else {
        Err(ForgeError::User("imgforge is not ready".to_string()))
    }
}

fn print_report(ctx: &UiContext, config: &Config, report: &HealthReport) {
    ui::intro(ctx, "imgforge status");

    ui::section(ctx, "Checks");
    for check in &report.checks {
        match &check.status {
            CheckStatus::Ok => {
                ui::step_ok_detail(ctx, check.name, &format!("{} ms", check.elapsed_ms))
            }
            CheckStatus::Failed { reason } => ui::step_error_detail(ctx, check.name, reason),
        }
    }

    ui::section(ctx, "Engine");
    let engine = &report.engine;
    ui::key_value(ctx, "workers", &engine.workers.to_string());
    ui::key_value(ctx, "running", &engine.running.to_string());
    ui::key_value(ctx, "queued", &engine.pending.to_string());
    ui::key_value(
        ctx,
        "timeout",
        &format!("{} ms", config.jobs.processing_timeout_ms),
    );

    ui::section(ctx, "Cache");
    match &engine.cache {
        Some(cache) => {
            ui::key_value(ctx, "entries", &cache.entries.to_string());
            ui::key_value_status(
                ctx,
                "usage",
                &format!(
                    "{} / {}",
                    format_bytes(cache.total_bytes),
                    format_bytes(cache.budget_bytes)
                ),
                cache.status == CacheSizeStatus::Ok,
            );
            ui::key_value(ctx, "ttl", &format!("{} s", cache.ttl_seconds));
        }
        None => ui::step_warn_hint(ctx, "Cache disabled", "Set CACHE_ENABLED=true"),
    }

    ui::section(ctx, "Ingest");
    ui::key_value_status(
        ctx,
        "url ingest",
        if config.ingest.url_enabled { "enabled" } else { "disabled" },
        true,
    );
    ui::key_value_status(
        ctx,
        "ssrf protection",
        if config.ingest.ssrf_protection { "on" } else { "off" },
        config.ingest.ssrf_protection,
    );

    if report.ready {
        ui::outro_success(ctx, "Ready");
    } else {
        ui::outro_error(ctx, "Not ready");
    }
}
