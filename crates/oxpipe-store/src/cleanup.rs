//! Periodic reclamation of stale package storage.
//!
//! Each pass walks the package root depth-first:
//!
//! - depth 0 is the root itself and is never deleted
//! - depth 1 entries are package directories (or ignored names such as
//!   `upload`); a package the [`ActivePackages`] lookup reports as active is
//!   skipped together with its whole subtree
//! - files older than the inactivity threshold are deleted
//! - directories are deleted once empty, provided their own modification
//!   time (sampled before their children were visited) is also stale
//!
//! Failures are logged per entry and never stop the pass.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{Result, StoreError};

/// Answers whether a package is currently owned by a job.
///
/// Called from the cleanup thread while jobs run, so implementations must be
/// cheap and must not block on job execution.
pub trait ActivePackages: Send + Sync {
    fn is_active(&self, package_id: &str) -> bool;
}

/// Lookup that never reports a package as active.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoActivePackages;

impl ActivePackages for NoActivePackages {
    fn is_active(&self, _package_id: &str) -> bool {
        false
    }
}

/// Lifecycle of the cleanup loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupStatus {
    NotStarted,
    Running,
    WaitingNextIteration,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CleanupStatus::NotStarted => "NOT_STARTED",
            CleanupStatus::Running => "RUNNING",
            CleanupStatus::WaitingNextIteration => "WAITING_NEXT_ITERATION",
            CleanupStatus::Stopping => "STOPPING",
            CleanupStatus::Stopped => "STOPPED",
            CleanupStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Settings for the cleanup service.
#[derive(Debug, Clone)]
pub struct CleanupSettings {
    /// The package root.
    pub root: PathBuf,
    /// Entries untouched for longer than this are deleted.
    pub max_inactive: Duration,
    /// Pause between passes.
    pub delay: Duration,
    /// Pause before the first pass.
    pub initial_delay: Duration,
    /// Names directly under the root that are never deleted themselves.
    pub ignore: Vec<String>,
}

impl CleanupSettings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_inactive: Duration::from_secs(30 * 60),
            delay: Duration::from_secs(60),
            initial_delay: Duration::from_secs(120),
            ignore: vec!["upload".to_string()],
        }
    }

    pub fn with_max_inactive(mut self, max_inactive: Duration) -> Self {
        self.max_inactive = max_inactive;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_ignore(mut self, ignore: Vec<String>) -> Self {
        self.ignore = ignore;
        self
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Number of files deleted.
    pub files_deleted: usize,
    /// Number of directories deleted.
    pub directories_deleted: usize,
    /// Package ids skipped because a job owns them.
    pub skipped_active: Vec<String>,
    /// Entries that could not be read or deleted.
    pub failures: usize,
    /// Whether the pass stopped early on cancellation.
    pub cancelled: bool,
}

struct Inner {
    settings: CleanupSettings,
    active: Arc<dyn ActivePackages>,
    ignore: RwLock<BTreeSet<String>>,
    status: RwLock<CleanupStatus>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background service deleting expired package data.
pub struct CleanupService {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl CleanupService {
    /// Create a service for an existing package root.
    pub fn new(settings: CleanupSettings, active: Arc<dyn ActivePackages>) -> Result<Self> {
        if settings.max_inactive.is_zero() {
            return Err(StoreError::InvalidSettings(
                "max inactive time must be positive".into(),
            ));
        }
        if settings.delay.is_zero() {
            return Err(StoreError::InvalidSettings("delay must be positive".into()));
        }
        if !settings.root.is_dir() {
            return Err(StoreError::InvalidSettings(format!(
                "package root '{}' is not a directory",
                settings.root.display()
            )));
        }
        debug!(root = %settings.root.display(), max_inactive = ?settings.max_inactive, "Cleanup service created");

        let ignore = settings.ignore.iter().cloned().collect();
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                active,
                ignore: RwLock::new(ignore),
                status: RwLock::new(CleanupStatus::NotStarted),
            }),
            running: Mutex::new(None),
        })
    }

    pub fn status(&self) -> CleanupStatus {
        *self.inner.status.read()
    }

    pub fn settings(&self) -> &CleanupSettings {
        &self.inner.settings
    }

    /// Never delete the entry with this name directly under the root.
    pub fn add_ignore(&self, name: impl Into<String>) {
        self.inner.ignore.write().insert(name.into());
    }

    pub fn remove_ignore(&self, name: &str) -> bool {
        self.inner.ignore.write().remove(name)
    }

    pub fn ignored(&self) -> Vec<String> {
        self.inner.ignore.read().iter().cloned().collect()
    }

    /// Run a single pass on the calling thread.
    pub fn run_once(&self) -> CleanupReport {
        self.inner.pass(&CancellationToken::new())
    }

    /// Start the periodic loop on the current tokio runtime.
    ///
    /// Returns `false` when the loop is already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        inner.set_status(CleanupStatus::WaitingNextIteration);

        let handle = tokio::spawn(async move {
            info!(root = %inner.settings.root.display(), "Cleanup loop started");
            let first = Instant::now() + inner.settings.initial_delay;
            let mut ticker = tokio::time::interval_at(first, inner.settings.delay);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.set_status(CleanupStatus::Running);
                        let pass_inner = Arc::clone(&inner);
                        let pass_token = token.clone();
                        let outcome =
                            tokio::task::spawn_blocking(move || pass_inner.pass(&pass_token)).await;
                        match outcome {
                            Ok(report) => debug!(
                                files = report.files_deleted,
                                directories = report.directories_deleted,
                                skipped = report.skipped_active.len(),
                                failures = report.failures,
                                "Cleanup pass finished"
                            ),
                            Err(e) => {
                                error!(error = %e, "Cleanup pass failed");
                                inner.set_status(CleanupStatus::Failed);
                                return;
                            }
                        }
                        inner.set_status(CleanupStatus::WaitingNextIteration);
                    }
                }
            }

            inner.set_status(CleanupStatus::Stopped);
            info!("Cleanup loop stopped");
        });

        *running = Some(Running { cancel, handle });
        true
    }

    /// Whether the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Cancel the loop and wait for it to exit.
    ///
    /// A pass in progress stops at the next entry.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        if self.status() != CleanupStatus::Failed {
            self.inner.set_status(CleanupStatus::Stopping);
        }
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!(error = %e, "Cleanup task ended abnormally");
            self.inner.set_status(CleanupStatus::Failed);
        }
    }
}

impl Drop for CleanupService {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl Inner {
    fn set_status(&self, status: CleanupStatus) {
        *self.status.write() = status;
    }

    fn pass(&self, token: &CancellationToken) -> CleanupReport {
        let mut report = CleanupReport::default();
        let threshold = SystemTime::now()
            .checked_sub(self.settings.max_inactive)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        trace!(root = %self.settings.root.display(), "Cleaning package root");
        self.clean(&self.settings.root, 0, threshold, token, &mut report);
        report
    }

    fn clean(
        &self,
        path: &Path,
        depth: usize,
        threshold: SystemTime,
        token: &CancellationToken,
        report: &mut CleanupReport,
    ) {
        if token.is_cancelled() {
            report.cancelled = true;
            return;
        }

        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot inspect entry");
                report.failures += 1;
                return;
            }
        };
        let expired = metadata.modified().is_ok_and(|modified| modified < threshold);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ignored = depth == 1 && self.ignore.read().contains(&name);

        if !metadata.is_dir() {
            if expired && !ignored {
                match std::fs::remove_file(path) {
                    Ok(()) => {
                        trace!(path = %path.display(), "Deleted file");
                        report.files_deleted += 1;
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Failed to delete file");
                        report.failures += 1;
                    }
                }
            }
            return;
        }

        if depth == 1 && self.active.is_active(&name) {
            trace!(package_id = %name, "Skipping active package");
            report.skipped_active.push(name);
            return;
        }

        match std::fs::read_dir(path) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    self.clean(&entry.path(), depth + 1, threshold, token, report);
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot list directory");
                report.failures += 1;
                return;
            }
        }

        if depth == 0 || ignored || !expired || token.is_cancelled() {
            return;
        }
        let is_empty = std::fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none());
        if is_empty {
            match std::fs::remove_dir(path) {
                Ok(()) => {
                    trace!(path = %path.display(), "Deleted directory");
                    report.directories_deleted += 1;
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to delete directory");
                    report.failures += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct Active(HashSet<String>);

    impl ActivePackages for Active {
        fn is_active(&self, package_id: &str) -> bool {
            self.0.contains(package_id)
        }
    }

    fn backdate(path: &Path) {
        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::open(path).unwrap().set_modified(old).unwrap();
    }

    fn service(root: &Path, active: &[&str]) -> CleanupService {
        let settings = CleanupSettings::new(root).with_max_inactive(Duration::from_secs(60));
        let active = Active(active.iter().map(|s| s.to_string()).collect());
        CleanupService::new(settings, Arc::new(active)).unwrap()
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let tmp = TempDir::new().unwrap();
        let zero = CleanupSettings::new(tmp.path()).with_max_inactive(Duration::ZERO);
        assert!(CleanupService::new(zero, Arc::new(NoActivePackages)).is_err());
        let missing = CleanupSettings::new(tmp.path().join("missing"));
        assert!(CleanupService::new(missing, Arc::new(NoActivePackages)).is_err());
    }

    #[test]
    fn test_stale_package_is_removed() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("DEMO-1-2");
        std::fs::create_dir(&pkg).unwrap();
        let file = pkg.join("a.xml");
        std::fs::write(&file, "x").unwrap();
        backdate(&file);
        backdate(&pkg);

        let report = service(tmp.path(), &[]).run_once();
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.directories_deleted, 1);
        assert!(!pkg.exists());
        assert!(tmp.path().exists());
    }

    #[test]
    fn test_active_package_is_never_touched() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("DEMO-1-2");
        std::fs::create_dir_all(pkg.join("nested")).unwrap();
        let file = pkg.join("nested/a.xml");
        std::fs::write(&file, "x").unwrap();
        backdate(&file);
        backdate(&pkg.join("nested"));
        backdate(&pkg);

        let report = service(tmp.path(), &["DEMO-1-2"]).run_once();
        assert_eq!(report.skipped_active, vec!["DEMO-1-2".to_string()]);
        assert_eq!(report.files_deleted, 0);
        assert!(file.exists());
    }

    #[test]
    fn test_empty_stale_directory_removed_root_kept() {
        let tmp = TempDir::new().unwrap();
        let empty = tmp.path().join("EMPTY-1-2");
        std::fs::create_dir(&empty).unwrap();
        backdate(&empty);
        backdate(tmp.path());

        let report = service(tmp.path(), &[]).run_once();
        assert_eq!(report.directories_deleted, 1);
        assert!(!empty.exists());
        assert!(tmp.path().is_dir());

        let again = service(tmp.path(), &[]).run_once();
        assert_eq!(again.directories_deleted, 0);
        assert!(tmp.path().is_dir());
    }

    #[test]
    fn test_fresh_entries_survive() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("NEW-1-2");
        std::fs::create_dir(&pkg).unwrap();
        std::fs::write(pkg.join("a.xml"), "x").unwrap();

        let report = service(tmp.path(), &[]).run_once();
        assert_eq!(report.files_deleted, 0);
        assert_eq!(report.directories_deleted, 0);
        assert!(pkg.join("a.xml").exists());
    }

    #[test]
    fn test_nested_stale_directories_cleaned_under_inactive_package() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("OLD-1-2");
        let deep = pkg.join("a/b");
        std::fs::create_dir_all(&deep).unwrap();
        let fresh = pkg.join("keep.xml");
        std::fs::write(&fresh, "x").unwrap();
        backdate(&deep);
        backdate(&pkg.join("a"));

        let report = service(tmp.path(), &[]).run_once();
        assert_eq!(report.directories_deleted, 2);
        assert!(!pkg.join("a").exists());
        assert!(fresh.exists());
        assert!(pkg.exists());
    }

    #[test]
    fn test_ignored_folder_kept_but_contents_cleaned() {
        let tmp = TempDir::new().unwrap();
        let upload = tmp.path().join("upload");
        std::fs::create_dir(&upload).unwrap();
        let stale = upload.join("old.zip");
        std::fs::write(&stale, "x").unwrap();
        backdate(&stale);
        backdate(&upload);

        let svc = service(tmp.path(), &[]);
        let report = svc.run_once();
        assert_eq!(report.files_deleted, 1);
        assert!(upload.is_dir());

        svc.remove_ignore("upload");
        backdate(&upload);
        let report = svc.run_once();
        assert_eq!(report.directories_deleted, 1);
        assert!(!upload.exists());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("stale.txt");
        std::fs::write(&file, "x").unwrap();
        backdate(&file);

        let settings = CleanupSettings::new(tmp.path())
            .with_max_inactive(Duration::from_secs(60))
            .with_delay(Duration::from_millis(20))
            .with_initial_delay(Duration::ZERO);
        let svc = CleanupService::new(settings, Arc::new(NoActivePackages)).unwrap();
        assert_eq!(svc.status(), CleanupStatus::NotStarted);

        assert!(svc.start());
        assert!(!svc.start());

        for _ in 0..100 {
            if !file.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!file.exists());
        assert!(svc.is_running());

        svc.stop().await;
        assert_eq!(svc.status(), CleanupStatus::Stopped);
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn test_stop_during_long_delay_is_immediate() {
        let tmp = TempDir::new().unwrap();
        let settings = CleanupSettings::new(tmp.path())
            .with_delay(Duration::from_secs(3600))
            .with_initial_delay(Duration::from_secs(3600));
        let svc = CleanupService::new(settings, Arc::new(NoActivePackages)).unwrap();
        svc.start();

        let started = std::time::Instant::now();
        svc.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(svc.status(), CleanupStatus::Stopped);
    }
}
