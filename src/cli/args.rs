//! CLI argument definitions using clap derive

use crate::transform::{Operation, OutputFormat, ResizeFit, TransformParams};
use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

/// imgforge - image transform engine
///
/// Resizes, thumbnails, rotates and re-encodes images on a bounded worker
/// pool, with a content-addressed result cache over local or S3 storage.
#[derive(Parser, Debug)]
#[command(name = "imgforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "IMGFORGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Transform one or more images
    Process(ProcessArgs),

    /// Copy a stored output to a file or stdout
    Fetch(FetchArgs),

    /// Check engine liveness and storage readiness
    Status(StatusArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the process command
#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("source").required(true).multiple(true).args(["inputs", "url"])))]
#[command(group(ArgGroup::new("operation").args(["resize", "thumbnail", "rotate", "grayscale"])))]
pub struct ProcessArgs {
    /// Input image files
    pub inputs: Vec<PathBuf>,

    /// Fetch an input from a URL (repeatable)
    #[arg(long)]
    pub url: Vec<String>,

    /// Resize to WIDTHxHEIGHT
    #[arg(long, value_name = "WxH", value_parser = parse_dimensions)]
    pub resize: Option<(u32, u32)>,

    /// How a resize fits the box: contain, cover, fill
    #[arg(long, default_value = "contain")]
    pub fit: ResizeFit,

    /// Scale so the longest edge is at most N pixels
    #[arg(long, value_name = "N")]
    pub thumbnail: Option<u32>,

    /// Rotate clockwise by a multiple of 90 degrees
    #[arg(long, value_name = "DEGREES", allow_hyphen_values = true, value_parser = parse_rotation)]
    pub rotate: Option<u8>,

    /// Convert to grayscale
    #[arg(long)]
    pub grayscale: bool,

    /// Output format: png, jpeg, webp (defaults to the input format)
    #[arg(short, long)]
    pub format: Option<OutputFormat>,

    /// JPEG quality 1-100
    #[arg(short, long)]
    pub quality: Option<u8>,

    /// Write outputs here (a file for a single job, otherwise a directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

impl ProcessArgs {
    /// Transform parameters shared by every job of this invocation
    pub fn params(&self) -> TransformParams {
        let operation = if let Some((width, height)) = self.resize {
            Operation::Resize {
                width,
                height,
                fit: self.fit,
            }
        } else if let Some(max_edge) = self.thumbnail {
            Operation::Thumbnail { max_edge }
        } else if let Some(quarter_turns) = self.rotate {
            Operation::Rotate { quarter_turns }
        } else if self.grayscale {
            Operation::Grayscale
        } else {
            Operation::Convert
        };

        TransformParams {
            operation,
            format: self.format,
            quality: self.quality,
        }
    }

    pub fn job_count(&self) -> usize {
        self.inputs.len() + self.url.len()
    }
}

/// Arguments for the fetch command
#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Storage key printed by `process`
    pub key: String,

    /// Destination file (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Print the health report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show effective configuration (file plus environment)
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value in the config file
    Set {
        /// Configuration key (e.g., cache.max_size_mb)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Parse `WIDTHxHEIGHT`
fn parse_dimensions(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid size '{s}': expected WIDTHxHEIGHT"))?;
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| format!("invalid width '{w}'"))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| format!("invalid height '{h}'"))?;
    if width == 0 || height == 0 {
        return Err(format!("invalid size '{s}': dimensions must be positive"));
    }
    Ok((width, height))
}

/// Parse degrees into clockwise quarter turns
fn parse_rotation(s: &str) -> Result<u8, String> {
    let degrees: i32 = s
        .trim()
        .parse()
        .map_err(|_| format!("invalid rotation '{s}'"))?;
    if degrees % 90 != 0 {
        return Err(format!("rotation must be a multiple of 90, got {degrees}"));
    }
    Ok((degrees.rem_euclid(360) / 90) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dimensions_valid() {
        assert_eq!(parse_dimensions("800x600").unwrap(), (800, 600));
        assert_eq!(parse_dimensions("10X20").unwrap(), (10, 20));
    }

    #[test]
    fn parse_dimensions_invalid() {
        assert!(parse_dimensions("800").is_err());
        assert!(parse_dimensions("0x10").is_err());
        assert!(parse_dimensions("axb").is_err());
    }

    #[test]
    fn parse_rotation_normalizes() {
        assert_eq!(parse_rotation("90").unwrap(), 1);
        assert_eq!(parse_rotation("-90").unwrap(), 3);
        assert_eq!(parse_rotation("360").unwrap(), 0);
        assert!(parse_rotation("45").is_err());
    }

    #[test]
    fn cli_parses_process_resize() {
        let cli = Cli::parse_from([
            "imgforge", "process", "a.png", "--resize", "100x50", "--fit", "cover", "-f", "webp",
        ]);
        match cli.command {
            Commands::Process(args) => {
                assert_eq!(args.inputs, vec![PathBuf::from("a.png")]);
                let params = args.params();
                assert_eq!(
                    params.operation,
                    Operation::Resize {
                        width: 100,
                        height: 50,
                        fit: ResizeFit::Cover
                    }
                );
                assert_eq!(params.format, Some(OutputFormat::Webp));
            }
            _ => panic!("expected Process command"),
        }
    }

    #[test]
    fn cli_parses_process_url_only() {
        let cli = Cli::parse_from([
            "imgforge",
            "process",
            "--url",
            "https://example.com/a.png",
            "--thumbnail",
            "64",
        ]);
        match cli.command {
            Commands::Process(args) => {
                assert_eq!(args.job_count(), 1);
                assert_eq!(args.params().operation, Operation::Thumbnail { max_edge: 64 });
            }
            _ => panic!("expected Process command"),
        }
    }

    #[test]
    fn cli_defaults_to_convert() {
        let cli = Cli::parse_from(["imgforge", "process", "a.png"]);
        match cli.command {
            Commands::Process(args) => assert_eq!(args.params().operation, Operation::Convert),
            _ => panic!("expected Process command"),
        }
    }

    #[test]
    fn cli_rejects_two_operations() {
        let result =
            Cli::try_parse_from(["imgforge", "process", "a.png", "--grayscale", "--rotate", "90"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_requires_a_source() {
        assert!(Cli::try_parse_from(["imgforge", "process", "--grayscale"]).is_err());
    }

    #[test]
    fn cli_parses_negative_rotation() {
        let cli = Cli::parse_from(["imgforge", "process", "a.png", "--rotate", "-90"]);
        match cli.command {
            Commands::Process(args) => {
                assert_eq!(args.params().operation, Operation::Rotate { quarter_turns: 3 })
            }
            _ => panic!("expected Process command"),
        }
    }

    #[test]
    fn cli_parses_status() {
        let cli = Cli::parse_from(["imgforge", "status", "--json"]);
        assert!(matches!(cli.command, Commands::Status(StatusArgs { json: true })));
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["imgforge", "status"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["imgforge", "-vv", "status"]);
        assert_eq!(cli.verbose, 2);
    }
}
