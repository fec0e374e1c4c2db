//! Configuration types.
//!
//! Every section is optional in the file; accessors fall back to the
//! values in [`defaults`] so callers never deal with partial configs.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Default values used when a section or field is absent.
pub mod defaults {
    /// Directory holding one sub-directory per model.
    pub const MODELS_DIR: &str = "models";
    /// Name of the package root created under the system temp directory.
    pub const TEMP_DIR_NAME: &str = "oxpipe";

    /// Files untouched for this long are reclaimed by the cleanup pass.
    pub const CLEANUP_MAX_INACTIVE_MINUTES: u64 = 30;
    /// Pause between cleanup passes.
    pub const CLEANUP_DELAY_SECONDS: u64 = 60;
    /// Pause before the first cleanup pass.
    pub const CLEANUP_INITIAL_DELAY_SECONDS: u64 = 120;
    /// Entries directly under the package root that are never deleted.
    pub const CLEANUP_IGNORE: &[&str] = &["upload", "logs"];

    /// Fast-lane pipeline workers.
    pub const JOB_WORKERS: usize = 1;
    /// How long a job is considered live after it starts.
    pub const JOB_MAX_INACTIVE_MINUTES: u64 = 60;
    /// Completed jobs retained before inactive ones are evicted.
    pub const MAX_COMPLETED_JOBS: usize = 1000;
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OxConfig {
    /// Filesystem roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<PathsConfig>,

    /// Periodic cleanup settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupConfig>,

    /// Job execution settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<JobsConfig>,
}

impl OxConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: OxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections merge field by field so a project file can override a
    /// single value without restating the whole section.
    pub fn merge(&mut self, other: OxConfig) {
        if let Some(paths) = other.paths {
            let base = self.paths.get_or_insert_with(PathsConfig::default);
            if paths.models_dir.is_some() {
                base.models_dir = paths.models_dir;
            }
            if paths.temp_dir.is_some() {
                base.temp_dir = paths.temp_dir;
            }
        }

        if other.cleanup.is_some() {
            self.cleanup = other.cleanup;
        }

        if other.jobs.is_some() {
            self.jobs = other.jobs;
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let cleanup = self.cleanup();
        if cleanup.max_inactive_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cleanup.max_inactive_minutes".into(),
                reason: "must be positive".into(),
            });
        }
        if cleanup.delay_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cleanup.delay_seconds".into(),
                reason: "must be positive".into(),
            });
        }
        if self.jobs().workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "jobs.workers".into(),
                reason: "at least one worker is required".into(),
            });
        }
        Ok(())
    }

    /// Directory holding one sub-directory per model.
    pub fn models_dir(&self) -> PathBuf {
        self.paths
            .as_ref()
            .and_then(|p| p.models_dir.clone())
            .unwrap_or_else(|| PathBuf::from(defaults::MODELS_DIR))
    }

    /// Package root. Every package directory lives directly below it.
    pub fn temp_dir(&self) -> PathBuf {
        self.paths
            .as_ref()
            .and_then(|p| p.temp_dir.clone())
            .unwrap_or_else(|| std::env::temp_dir().join(defaults::TEMP_DIR_NAME))
    }

    /// Effective cleanup settings.
    pub fn cleanup(&self) -> CleanupConfig {
        self.cleanup.clone().unwrap_or_default()
    }

    /// Effective job settings.
    pub fn jobs(&self) -> JobsConfig {
        self.jobs.clone().unwrap_or_default()
    }

    /// Override the models root.
    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.get_or_insert_with(PathsConfig::default).models_dir = Some(dir.into());
        self
    }

    /// Override the package root.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.get_or_insert_with(PathsConfig::default).temp_dir = Some(dir.into());
        self
    }
}

/// `[paths]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
}

/// `[cleanup]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Whether the engine starts the periodic cleanup loop.
    pub enabled: bool,
    pub max_inactive_minutes: u64,
    pub delay_seconds: u64,
    pub initial_delay_seconds: u64,
    /// Names directly under the package root that are never deleted.
    pub ignore: Vec<String>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_inactive_minutes: defaults::CLEANUP_MAX_INACTIVE_MINUTES,
            delay_seconds: defaults::CLEANUP_DELAY_SECONDS,
            initial_delay_seconds: defaults::CLEANUP_INITIAL_DELAY_SECONDS,
            ignore: defaults::CLEANUP_IGNORE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CleanupConfig {
    pub fn max_inactive(&self) -> Duration {
        Duration::from_secs(self.max_inactive_minutes * 60)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_seconds)
    }
}

/// `[jobs]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Fast-lane workers. One extra worker always serves the slow lane.
    pub workers: usize,
    pub max_inactive_minutes: u64,
    pub max_completed_jobs: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: defaults::JOB_WORKERS,
            max_inactive_minutes: defaults::JOB_MAX_INACTIVE_MINUTES,
            max_completed_jobs: defaults::MAX_COMPLETED_JOBS,
        }
    }
}

impl JobsConfig {
    pub fn max_inactive(&self) -> Duration {
        Duration::from_secs(self.max_inactive_minutes * 60)
    }
}
