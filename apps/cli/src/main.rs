//! Mosaic CLI - trains text + expert-feature fusion models from a config file
//!
//! This crate provides the `mosaic-train` binary. A run is described by one
//! JSON or TOML document; flags select it, resume from a checkpoint and
//! override individual keys.

mod logging;
mod train;

use clap::{Parser, ValueEnum};
use colored::Colorize;
use mosaic_training::{Termination, TrainingError};
use std::path::PathBuf;
use std::process::ExitCode;

/// Mosaic trainer
///
/// Builds the data loaders, model, loss, metrics, optimizer and scheduler named
/// in the config and trains until the configured epochs run out or early
/// stopping triggers. Ctrl-C stops between steps.
#[derive(Parser, Debug)]
#[command(name = "mosaic-train", author, version, about = "Mosaic - multi-modal training orchestrator")]
pub struct Args {
    /// Config file path (.json or .toml); optional when resuming
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to a checkpoint to resume from
    #[arg(short, long)]
    pub resume: Option<PathBuf>,

    /// Devices to use: "auto", "cpu" or comma-separated accelerator ids
    #[arg(short, long)]
    pub device: Option<String>,

    /// Send scalars to the remote experiment tracker
    #[arg(short, long)]
    pub observe: bool,

    /// Learning rate (optimizer.args.lr)
    #[arg(long)]
    pub lr: Option<f64>,

    /// Batch size (data_loader.args.batch_size)
    #[arg(long)]
    pub bs: Option<usize>,

    /// Override any config key, e.g. `-s trainer.epochs=3` (repeatable)
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Run id used for the run directories (defaults to a timestamp)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Log level (trace, debug, info, warn, error); defaults to trainer.verbosity
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Print the registered component types and exit
    #[arg(long)]
    pub list_components: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Exit code for a run stopped by Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;
/// Exit code for errors raised while reading the config or building components.
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.list_components {
        return match train::list_components() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => report(&e),
        };
    }

    match train::execute(args).await {
        Ok(Termination::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

fn report(error: &anyhow::Error) -> ExitCode {
    eprintln!("{} {error:#}", "error:".red().bold());
    let construction = error.downcast_ref::<TrainingError>().is_some_and(TrainingError::is_construction_error)
        || error.downcast_ref::<clap::Error>().is_some();
    if construction { ExitCode::from(EXIT_CONFIG) } else { ExitCode::FAILURE }
}
