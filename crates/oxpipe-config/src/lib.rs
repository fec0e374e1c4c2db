//! Configuration system for the oxpipe pipeline engine.
//!
//! Provides TOML-based configuration with:
//! - Filesystem roots for models and packages (`[paths]`)
//! - Periodic cleanup tuning (`[cleanup]`)
//! - Job worker and retention settings (`[jobs]`)
//! - Config file layering (XDG user config + project-local overrides + env)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigLayer, LayerKind, LoadedConfig, load_config, load_config_file,
    load_config_with_options, save_config, user_config_dir, user_config_file,
};
pub use error::{ConfigError, Result};
pub use types::*;
