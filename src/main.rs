//! imgforge - image transform job engine
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use imgforge::cli::{commands, Cli, Commands};
use imgforge::config::ConfigManager;
use imgforge::error::ForgeResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> ForgeResult<()> {
    let cli = Cli::parse();
    imgforge::ui::init_theme();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Config commands must work even when the file or environment is invalid
    if let Commands::Config(args) = cli.command {
        init_tracing(cli.verbose, None, false);
        return commands::config(args, &manager).await;
    }

    let config = manager.load_effective().await?;
    let level = std::env::var_os("LOG_LEVEL")
        .is_some()
        .then_some(config.general.log_level.as_str());
    init_tracing(cli.verbose, level, config.general.log_format == "json");
    debug!("Loaded configuration from {}", manager.path().display());

    match cli.command {
        Commands::Process(args) => commands::process(args, &config).await,
        Commands::Fetch(args) => commands::fetch(args, &config).await,
        Commands::Status(args) => commands::status(args, &config).await,
        Commands::Config(_) => unreachable!("Config handled above"),
    }
}

/// Logging: -v info, -vv debug; otherwise LOG_LEVEL when set, else warn so
/// spinners stay readable
fn init_tracing(verbose: u8, level: Option<&str>, json: bool) {
    let filter = match (verbose, level) {
        (0, Some(level)) => EnvFilter::new(format!("imgforge={}", level)),
        (0, None) => EnvFilter::new("imgforge=warn"),
        (1, _) => EnvFilter::new("imgforge=info"),
        _ => EnvFilter::new("imgforge=debug"),
    };

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }
}
