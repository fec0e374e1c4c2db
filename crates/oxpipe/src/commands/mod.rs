//! CLI command handlers.

use std::sync::Arc;

use oxpipe_config::OxConfig;
use oxpipe_pipeline::{ModelCatalog, StepRegistry};

pub mod clean;
pub mod models;
pub mod package;
pub mod run;
pub mod show;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Effective configuration (files, environment and flags merged).
    pub config: OxConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Step implementations available to this binary.
    pub fn registry(&self) -> StepRegistry {
        StepRegistry::with_builtins()
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::new(self.config.models_dir(), Arc::new(self.registry()))
    }
}
