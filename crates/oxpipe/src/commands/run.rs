//! Run command - create a package and run a pipeline on it.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::{Style, style};
use oxpipe_pipeline::{Engine, JobState, ResultStatus};

use super::Context;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Model name
    pub model: String,

    /// Pipeline id (defaults to the model's default pipeline)
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Input file copied into the new package
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Package parameter as key=value (repeatable)
    #[arg(long = "param", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// Queue on the slow lane
    #[arg(long)]
    pub slow: bool,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid parameter '{s}', expected key=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid parameter '{s}', empty key"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let engine = Engine::new(&ctx.config, ctx.registry()).context("cannot set up engine")?;
    engine.start();

    let job = engine.submit(
        &args.model,
        args.pipeline.as_deref(),
        args.file.as_deref(),
        &args.params,
        args.slow,
    );
    let job = match job {
        Ok(job) => job,
        Err(e) => {
            engine.shutdown().await;
            return Err(e.into());
        }
    };
    let status = engine.manager().wait_for(job.id()).await;
    engine.shutdown().await;
    let status = status?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&job.summary())?);
    } else if ctx.verbose {
        println!("{}", job.to_xml().to_pretty_string()?);
    } else {
        let dim = Style::new().dim();
        println!("{} {}", style("Job").bold(), job.id());
        println!("  {} {}", dim.apply_to("Package:"), job.package_id());
        println!("  {} {}", dim.apply_to("Pipeline:"), job.pipeline().id());
        for result in job.results() {
            let status = match result.status {
                ResultStatus::Ok => style(result.status.to_string()).green(),
                ResultStatus::Warning => style(result.status.to_string()).yellow(),
                ResultStatus::Error => style(result.status.to_string()).red(),
            };
            println!(
                "  {:<20} {:<8} {}",
                result.step_id,
                status,
                dim.apply_to(format!("{} ms", result.time_ms))
            );
        }
        if let Some(download) = job.download_path() {
            println!("  {} {}", dim.apply_to("Download:"), download);
        }
    }

    if status.state() == JobState::Error {
        bail!(
            "job {} failed: {}",
            job.id(),
            status.message().unwrap_or("unknown error")
        );
    }
    Ok(())
}
