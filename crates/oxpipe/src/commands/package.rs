//! Package command - print a stored package.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use clap::Args;
use oxpipe_store::PackageStore;
use serde::Serialize;

use super::Context;

/// Arguments for the package command.
#[derive(Args, Debug)]
pub struct PackageArgs {
    /// Package id
    pub id: String,
}

#[derive(Debug, Serialize)]
struct PackageOutput {
    id: String,
    created: DateTime<Utc>,
    directory: String,
    media_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    original: Option<String>,
    properties: BTreeMap<String, String>,
    parameters: BTreeMap<String, String>,
}

/// Run the package command.
pub async fn run(args: PackageArgs, ctx: &Context) -> Result<()> {
    let store = PackageStore::new(ctx.config.temp_dir())?;
    let Some(package) = store.get_package(&args.id) else {
        bail!("package '{}' not found in {}", args.id, store.root().display());
    };

    if ctx.json_output {
        let output = PackageOutput {
            id: package.id().to_string(),
            created: package.created(),
            directory: package.directory_path(),
            media_type: package.media_type(),
            original: package.original_name().map(str::to_string),
            properties: package.properties().into_iter().collect(),
            parameters: package.parameters().into_iter().collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", package.to_xml().to_pretty_string()?);
    }
    Ok(())
}
