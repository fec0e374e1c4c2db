//! Models command - list models and their pipelines.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use serde::Serialize;

use super::Context;

/// Arguments for the models command.
#[derive(Args, Debug)]
pub struct ModelsArgs {
    /// Re-read every model definition before listing
    #[arg(long)]
    pub reload: bool,
}

#[derive(Debug, Serialize)]
struct ModelOutput {
    name: String,
    loaded: bool,
    pipelines: Vec<PipelineOutput>,
}

#[derive(Debug, Serialize)]
struct PipelineOutput {
    id: String,
    name: String,
    accepts: String,
    default: bool,
    steps: Vec<String>,
}

/// Run the models command.
pub async fn run(args: ModelsArgs, ctx: &Context) -> Result<()> {
    let catalog = ctx.catalog();
    if args.reload {
        catalog.reload_all();
    }

    let output: Vec<ModelOutput> = catalog
        .models()
        .iter()
        .map(|model| ModelOutput {
            name: model.name().to_string(),
            loaded: model.is_loaded(),
            pipelines: model
                .pipelines()
                .iter()
                .map(|p| PipelineOutput {
                    id: p.id().to_string(),
                    name: p.name().to_string(),
                    accepts: p.accepts().to_string(),
                    default: p.is_default(),
                    steps: p.steps().iter().map(|s| s.id().to_string()).collect(),
                })
                .collect(),
        })
        .collect();

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    let red = Style::new().red();
    if output.is_empty() {
        println!(
            "No models found in {}",
            dim.apply_to(catalog.models_dir().display())
        );
        return Ok(());
    }

    for model in &output {
        if model.loaded {
            println!("{}", style(&model.name).bold());
        } else {
            println!("{} {}", style(&model.name).bold(), red.apply_to("(failed to load)"));
        }
        for pipeline in &model.pipelines {
            let marker = if pipeline.default { "*" } else { " " };
            println!(
                "  {} {} {} {}",
                style(marker).cyan(),
                style(&pipeline.id).cyan(),
                pipeline.name,
                dim.apply_to(format!("[{}] {} step(s)", pipeline.accepts, pipeline.steps.len()))
            );
            if ctx.verbose {
                for step in &pipeline.steps {
                    println!("      - {step}");
                }
            }
        }
    }
    Ok(())
}
