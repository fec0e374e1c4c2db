//! Locating settings files and folding them into one [`OxConfig`].
//!
//! Layers are applied lowest precedence first:
//!
//! | layer   | location                                          |
//! |---------|---------------------------------------------------|
//! | user    | `<config dir>/oxpipe/config.toml`                 |
//! | project | `oxpipe.toml` in the project (or working) dir     |
//! | env     | `OXPIPE_MODELS_DIR`, `OXPIPE_TEMP_DIR`            |
//!
//! Command line flags are applied by the binary on top of the result.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{ConfigError, OxConfig, Result};

const PROJECT_FILE: &str = "oxpipe.toml";
const USER_FILE: &str = "config.toml";

const ENV_CONFIG_DIR: &str = "OXPIPE_CONFIG_DIR";
const ENV_MODELS_DIR: &str = "OXPIPE_MODELS_DIR";
const ENV_TEMP_DIR: &str = "OXPIPE_TEMP_DIR";

/// Which file a [`ConfigLayer`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    User,
    Project,
}

/// One candidate settings file and whether it contributed.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub kind: LayerKind,
    pub path: PathBuf,
    pub applied: bool,
}

/// Outcome of [`load_config`]: the effective settings plus provenance.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: OxConfig,
    pub layers: Vec<ConfigLayer>,
    /// Human readable notes about layers that were skipped because they were broken.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Files that actually contributed, lowest precedence first.
    pub fn applied_paths(&self) -> impl Iterator<Item = &Path> {
        self.layers
            .iter()
            .filter(|layer| layer.applied)
            .map(|layer| layer.path.as_path())
    }
}

pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], but `config_dir` replaces the user settings
/// directory (taking priority over `OXPIPE_CONFIG_DIR`).
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut candidates = Vec::with_capacity(2);
    let user_file = config_dir
        .map(Path::to_path_buf)
        .or_else(user_config_dir)
        .map(|dir| dir.join(USER_FILE));
    if let Some(path) = user_file {
        candidates.push((LayerKind::User, path));
    }
    let project_file = match project_dir {
        Some(dir) => dir.join(PROJECT_FILE),
        None => PathBuf::from(PROJECT_FILE),
    };
    candidates.push((LayerKind::Project, project_file));

    let mut loaded = LoadedConfig {
        config: OxConfig::new(),
        layers: Vec::with_capacity(candidates.len()),
        warnings: Vec::new(),
    };
    for (kind, path) in candidates {
        let applied = apply_layer(&mut loaded, &path);
        loaded.layers.push(ConfigLayer {
            kind,
            path,
            applied,
        });
    }

    loaded.config = env_overrides(std::mem::take(&mut loaded.config));
    Ok(loaded)
}

/// Parse a single settings file.
pub fn load_config_file(path: &Path) -> Result<OxConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    OxConfig::from_toml(&text)
}

/// Write `config` to `path`, creating missing parent directories.
pub fn save_config(config: &OxConfig, path: &Path) -> Result<()> {
    let unwritable = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigError::Unwritable { path, source }
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(unwritable(parent))?;
    }
    std::fs::write(path, config.to_toml()?).map_err(unwritable(path))
}

/// Per-user settings directory: `OXPIPE_CONFIG_DIR` if set, else the
/// platform config dir joined with `oxpipe`.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var_os(ENV_CONFIG_DIR) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|base| base.join("oxpipe")),
    }
}

pub fn user_config_file() -> Option<PathBuf> {
    user_config_dir().map(|dir| dir.join(USER_FILE))
}

/// Merge `path` into `loaded.config`. Returns whether it was applied.
fn apply_layer(loaded: &mut LoadedConfig, path: &Path) -> bool {
    if !path.is_file() {
        debug!(path = %path.display(), "no settings file here");
        return false;
    }
    match load_config_file(path) {
        Ok(layer) => {
            debug!(path = %path.display(), "settings layer applied");
            loaded.config.merge(layer);
            true
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "ignoring broken settings file");
            loaded
                .warnings
                .push(format!("ignored {}: {error}", path.display()));
            false
        }
    }
}

fn env_overrides(mut config: OxConfig) -> OxConfig {
    let non_empty = |name: &str| std::env::var_os(name).filter(|v| !v.is_empty());
    if let Some(dir) = non_empty(ENV_MODELS_DIR) {
        config = config.with_models_dir(dir);
    }
    if let Some(dir) = non_empty(ENV_TEMP_DIR) {
        config = config.with_temp_dir(dir);
    }
    config
}
