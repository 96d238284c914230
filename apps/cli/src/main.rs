//! Tessera CLI - train, validate and inspect run configurations
//!
//! Provides a `tessera` command that wires the reference engine and CSV
//! record sources into the training orchestrator.

mod commands;
mod logging;
mod setup;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tessera - configuration-driven model training
#[derive(Parser, Debug)]
#[command(name = "tessera", author, version, about = "Tessera - configuration-driven model training")]
struct Args {
    /// Console log level (trace, debug, info, warn, error, off). Overrides logging.console.level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model described by a configuration file
    ///
    /// Writes logs, telemetry and a run manifest under
    /// <root_dir>/<data_name>/<experiment_name>/<model>/<run_id>/.
    Train {
        /// Path to the run configuration (YAML)
        config: PathBuf,

        /// Override hyper_parameters.epochs
        #[arg(long)]
        epochs: Option<u32>,

        /// Override meta.rand_seed
        #[arg(long)]
        seed: Option<u64>,

        /// Output the run manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a configuration without training
    ///
    /// Runs the full setup: schema, graph analysis, datasets, objectives,
    /// optimizers and trackers. Every declared split is opened once.
    Validate {
        /// Path to the run configuration (YAML)
        config: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show graph outputs, optimizer bindings and tracker entries
    Info {
        /// Path to the run configuration (YAML)
        config: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Train { config, epochs, seed, json } => {
            commands::train::execute(commands::train::TrainOptions { config, epochs, seed, json }, args.log_level)
                .await?;
        }
        Command::Validate { config, json } => {
            commands::validate::execute(&config, json, args.log_level.as_deref())?;
        }
        Command::Info { config, json } => {
            commands::info::execute(&config, json, args.log_level.as_deref())?;
        }
    }

    Ok(())
}
