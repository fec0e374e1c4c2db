//! oxpipe - document processing pipelines
//!
//! Main entry point for the oxpipe CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

mod commands;

use commands::{clean, models, package, run, show};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// oxpipe - run packages through model-defined processing pipelines
#[derive(Parser)]
#[command(name = "oxpipe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Print step details and debug logs
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Directory holding the user config.toml
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Root directory of the model definitions
    #[arg(long, global = true)]
    pub models_dir: Option<PathBuf>,

    /// Root directory of the packages
    #[arg(long, global = true)]
    pub temp_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List models and their pipelines
    Models(models::ModelsArgs),

    /// Print a model or pipeline definition
    Show(show::ShowArgs),

    /// Run a pipeline on a new package
    Run(run::RunArgs),

    /// Print a package
    Package(package::PackageArgs),

    /// Delete expired package data
    Clean(clean::CleanArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = oxpipe_config::load_config_with_options(None, cli.config_dir.as_deref())?;
    let mut config = loaded.config;
    if let Some(dir) = cli.models_dir {
        config = config.with_models_dir(dir);
    }
    if let Some(dir) = cli.temp_dir {
        config = config.with_temp_dir(dir);
    }

    // Console (human-readable, stderr) + rotating JSON file under the package root
    let filter = if cli.verbose {
        "oxpipe=debug,oxpipe_pipeline=debug,oxpipe_store=debug,oxpipe_config=debug,info"
    } else {
        "oxpipe=info,oxpipe_pipeline=info,oxpipe_store=warn,oxpipe_config=warn,warn"
    };

    let log_dir = config.temp_dir().join("logs");
    let file_appender = tracing_appender::rolling::daily(&log_dir, "oxpipe.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "oxpipe=trace,oxpipe_pipeline=trace,oxpipe_store=debug,oxpipe_config=debug,info",
                )),
        )
        .init();

    for warning in &loaded.warnings {
        warn!("{warning}");
    }

    let ctx = commands::Context {
        config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Models(args) => models::run(args, &ctx).await,
        Commands::Show(args) => show::run(args, &ctx).await,
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Package(args) => package::run(args, &ctx).await,
        Commands::Clean(args) => clean::run(args, &ctx).await,
    }
}
