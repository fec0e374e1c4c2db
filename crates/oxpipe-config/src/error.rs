//! Errors raised while resolving or persisting `oxpipe.toml` settings.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Persisting settings (or creating their directory) failed.
    #[error("cannot write {}: {source}", path.display())]
    Unwritable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("settings cannot be rendered as TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// Parsed fine, but a value is outside its allowed range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}
