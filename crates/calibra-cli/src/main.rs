//! Calibra CLI - inspect calibration structure of model checkpoints
//!
//! Lists the compiled-in architecture adapters, prints the blocks, norm sets
//! and subsets an adapter derives from a checkpoint, and runs multimodal
//! calibration preprocessing over a file of (image, question) pairs.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

/// Calibra - calibration adapters for transformer checkpoints
///
/// Examples:
///   calibra list
///   calibra inspect --model-path ./Llama-3.2-11B-Vision --block 3
///   calibra preprocess --model-path ./llava-1.5-7b --pairs pairs.json
#[derive(Parser)]
#[command(
    name = "calibra",
    about = "Inspect calibration blocks and subsets of model checkpoints",
    version = env!("CARGO_PKG_VERSION"),
    arg_required_else_help = true,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Adapter configuration file (JSON)
    #[arg(long, global = true, value_name = "PATH", env = "CALIBRA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long = "output-format",
        global = true,
        value_enum,
        default_value = "table"
    )]
    pub output_format: OutputFormat,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered architectures
    #[command(name = "list", alias = "ls")]
    List,

    /// Print blocks, norm sets and subsets of a checkpoint
    #[command(name = "inspect")]
    Inspect {
        #[command(flatten)]
        model: ModelArgs,

        /// Only show this block
        #[arg(short, long)]
        block: Option<usize>,

        /// Shorthand for `--output-format json`
        #[arg(long)]
        json: bool,
    },

    /// Turn (image, question) pairs into calibration samples
    ///
    /// The pairs file is a JSON array of `{"image": "...", "question": "..."}`
    /// objects. Relative image paths resolve against the current directory.
    #[command(name = "preprocess")]
    Preprocess {
        #[command(flatten)]
        model: ModelArgs,

        /// JSON file of calibration pairs
        #[arg(short, long, value_name = "PATH")]
        pairs: PathBuf,

        /// Skip pairs that fail instead of aborting
        #[arg(long)]
        skip_invalid: bool,
    },
}

/// Options selecting and loading a checkpoint. Flags override the
/// configuration file and `CALIBRA_*` environment variables.
#[derive(Args, Clone, Default)]
pub struct ModelArgs {
    /// Registered architecture (defaults to the checkpoint's model_type)
    #[arg(short = 't', long)]
    pub model_type: Option<String>,

    /// Checkpoint directory
    #[arg(short = 'm', long, value_name = "DIR")]
    pub model_path: Option<PathBuf>,

    /// Weight precision (auto, float32, float16, bfloat16)
    #[arg(long)]
    pub dtype: Option<String>,

    /// Device (auto, cpu, cuda, cuda:N, metal)
    #[arg(long)]
    pub device: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    Table,
    /// JSON output
    Json,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "calibra=debug,calibra_core=debug"
    } else {
        "calibra=info,calibra_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List => commands::list(cli.output_format),

        Commands::Inspect { model, block, json } => {
            let format = if json {
                OutputFormat::Json
            } else {
                cli.output_format
            };
            let config = commands::adapter_config(cli.config.as_deref(), &model)?;
            commands::inspect(&config, block, format)
        }

        Commands::Preprocess {
            model,
            pairs,
            skip_invalid,
        } => {
            let config = commands::adapter_config(cli.config.as_deref(), &model)?;
            commands::preprocess(&config, &pairs, skip_invalid, cli.output_format)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn inspect_accepts_block_and_json() {
        let cli = Cli::parse_from([
            "calibra",
            "inspect",
            "--model-path",
            "/models/mllama",
            "--block",
            "3",
            "--json",
        ]);
        match cli.command {
            Commands::Inspect { model, block, json } => {
                assert_eq!(model.model_path, Some(PathBuf::from("/models/mllama")));
                assert_eq!(block, Some(3));
                assert!(json);
            }
            _ => panic!("expected inspect"),
        }
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from([
            "calibra",
            "preprocess",
            "-m",
            "/models/llava",
            "--pairs",
            "pairs.json",
            "--skip-invalid",
            "--verbose",
        ]);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Preprocess {
                skip_invalid: true,
                ..
            }
        ));
    }
}
