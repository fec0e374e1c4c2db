//! Clean command - reclaim expired package storage.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use console::{Style, style};
use oxpipe_store::{
    CleanupReport, CleanupService, CleanupSettings, NoActivePackages, PackageStore,
};
use tracing::info;

use super::Context;

/// Arguments for the clean command.
#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Run a single pass and exit instead of cleaning periodically
    #[arg(long)]
    pub once: bool,

    /// Override the inactivity threshold in minutes
    #[arg(long)]
    pub max_inactive_minutes: Option<u64>,
}

/// Run the clean command.
pub async fn run(args: CleanArgs, ctx: &Context) -> Result<()> {
    let store = PackageStore::new(ctx.config.temp_dir())?;
    let mut cleanup = ctx.config.cleanup();
    if let Some(minutes) = args.max_inactive_minutes {
        cleanup.max_inactive_minutes = minutes;
    }

    let settings = CleanupSettings::new(store.root())
        .with_max_inactive(cleanup.max_inactive())
        .with_delay(cleanup.delay())
        .with_initial_delay(cleanup.initial_delay())
        .with_ignore(cleanup.ignore.clone());
    // Jobs of other processes are invisible here; only stale data is touched.
    let service = CleanupService::new(settings, Arc::new(NoActivePackages))
        .context("cannot set up cleanup")?;

    if args.once {
        let report = service.run_once();
        print_report(&report, ctx)?;
        return Ok(());
    }

    service.start();
    info!(root = %store.root().display(), "Cleaning periodically, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    service.stop().await;
    Ok(())
}

fn print_report(report: &CleanupReport, ctx: &Context) -> Result<()> {
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!("{}", style("Cleanup").bold());
    println!("  {} {}", dim.apply_to("Files deleted:"), style(report.files_deleted).cyan());
    println!(
        "  {} {}",
        dim.apply_to("Directories deleted:"),
        style(report.directories_deleted).cyan()
    );
    if report.failures > 0 {
        println!("  {} {}", dim.apply_to("Failures:"), style(report.failures).red());
    }
    Ok(())
}
