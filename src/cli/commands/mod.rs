//! CLI command implementations

pub mod config;
pub mod fetch;
pub mod process;
pub mod status;

pub use config::execute as config;
pub use fetch::execute as fetch;
pub use process::execute as process;
pub use status::execute as status;
