//! UI module for consistent CLI output
//!
//! Uses `cliclack` for styled steps and spinners, with automatic fallback to
//! plain output in CI/non-interactive environments.
//!
//! # Example
//!
//! ```rust,ignore
//! use imgforge::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect();
//!
//! ui::intro(&ctx, "imgforge status");
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Probing storage...");
//! spinner.stop("Storage ready");
//!
//! ui::step_warn_hint(&ctx, "Cache disabled", "Set CACHE_ENABLED=true");
//! ui::outro_success(&ctx, "Ready");
//! ```

mod context;
mod output;
mod progress;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, outro_error, outro_success, remark, section,
    step_error_detail, step_ok, step_ok_detail, step_warn_hint,
};
pub use progress::{JobProgress, TaskSpinner};
pub use theme::{init_theme, ForgeTheme};
