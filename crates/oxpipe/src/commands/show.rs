//! Show command - print a model or pipeline definition as XML.

use anyhow::{Result, bail};
use clap::Args;

use super::Context;

/// Arguments for the show command.
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Model name
    pub model: String,

    /// Only this pipeline
    #[arg(short, long)]
    pub pipeline: Option<String>,
}

/// Run the show command.
pub async fn run(args: ShowArgs, ctx: &Context) -> Result<()> {
    let catalog = ctx.catalog();
    let model = catalog.get(&args.model)?;
    if !model.is_loaded() {
        bail!("model '{}' failed to load, see the log for details", args.model);
    }

    let xml = match &args.pipeline {
        Some(id) => match model.pipeline(id) {
            Some(pipeline) => pipeline.to_xml(),
            None => bail!("pipeline '{id}' not found in model '{}'", args.model),
        },
        None => model.to_xml(),
    };
    println!("{}", xml.to_pretty_string()?);
    Ok(())
}
