//! Fetch command - copy a stored output by key

use crate::cli::args::FetchArgs;
use crate::config::Config;
use crate::error::{ForgeError, ForgeResult};
use crate::storage::{create_backend, validate_key};
use crate::ui::{self, UiContext};
use std::io::Write;
use tokio::fs;
use tracing::debug;

/// Execute the fetch command
pub async fn execute(args: FetchArgs, config: &Config) -> ForgeResult<()> {
    validate_key(&args.key)?;
    let storage = create_backend(&config.storage).await?;
    debug!("Reading {} from {} storage", args.key, storage.backend_name());

    let bytes = storage.get(&args.key).await?;

    match args.output {
        Some(path) => {
            fs::write(&path, &bytes)
                .await
                .map_err(|e| ForgeError::io(format!("writing {}", path.display()), e))?;
            let ctx = UiContext::detect();
            ui::step_ok_detail(
                &ctx,
                &format!("Wrote {} bytes", bytes.len()),
                &path.display().to_string(),
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&bytes)
                .and_then(|()| stdout.flush())
                .map_err(|e| ForgeError::io("writing to stdout", e))?;
        }
    }

    Ok(())
}
