//! Tuneforge CLI - command-line front end for fine-tuning runs
//!
//! Provides the `tuneforge` command: validate a run configuration, train
//! with the bundled bigram backend, export the result and list local models.

mod backend;
mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::types::RunOptions;
use commands::{export, import, models, train, validate};

#[derive(Parser, Debug)]
#[command(
    name = "tuneforge",
    author,
    version,
    about = "Tuneforge - supervised fine-tuning run controller",
    long_about = "Tuneforge validates fine-tuning settings, loads a model with bounded retries, trains epoch by epoch \
                  with checkpointing and early stopping, and exports the best model."
)]
struct Args {
    /// trace, debug, info, warn or error (default from the CLI config, else info)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a fine-tuning job
    Train {
        #[command(flatten)]
        options: RunOptions,

        /// Export the best model when the run succeeds
        #[arg(long)]
        export: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check run settings without training
    Validate {
        #[command(flatten)]
        options: RunOptions,

        #[arg(long)]
        json: bool,
    },

    /// Export the best checkpoint of a finished run
    Export {
        /// Run output directory (holds run_manifest.json)
        #[arg(short, long)]
        output: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Build run settings from an exported model's config.json
    Import {
        /// Directory holding config.json
        model_dir: PathBuf,

        /// Run settings to start from
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the result here instead of printing it
        #[arg(short, long)]
        write: Option<PathBuf>,
    },

    /// List models in the local model directory
    Models {
        #[arg(short, long)]
        dir: Option<String>,

        #[arg(long)]
        json: bool,
    },
}

fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cli_config = config::CliConfig::discover_and_load();

    let level = args.log_level.as_deref().or(cli_config.log_level.as_deref()).map_or(Level::INFO, parse_level);

    // Logs go to stderr so `--json` output stays parseable.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let json_default = cli_config.wants_json();
    match args.command {
        Command::Train { options, export, json } => {
            train::execute(options, export, json || json_default, &cli_config).await
        }
        Command::Validate { options, json } => validate::execute(&options, json || json_default, &cli_config),
        Command::Export { output, json } => export::execute(output, json || json_default, &cli_config),
        Command::Import { model_dir, config, write } => import::execute(&model_dir, config, write, &cli_config),
        Command::Models { dir, json } => models::execute(dir, json || json_default, &cli_config),
    }
}
