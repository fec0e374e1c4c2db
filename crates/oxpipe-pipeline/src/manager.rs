//! Job registry and worker pool.
//!
//! [`JobRegistry`] remembers every submitted job and answers the cleanup
//! service's "is this package in use" question. [`JobManager`] feeds jobs to
//! tokio workers: `workers` tasks share the fast lane, one more task serves
//! the slow lane. Step code is synchronous file work, so each job runs on
//! the blocking pool.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use oxpipe_store::{ActivePackages, PackageData};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::job::{DEFAULT_MAX_INACTIVE, Job, JobStatus, PipelineJob, StepJob};

/// Completed jobs kept before the oldest inactive ones are evicted.
pub const DEFAULT_MAX_COMPLETED: usize = 1000;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Fast-lane workers; at least one runs.
    pub workers: usize,
    /// Inactivity threshold given to submitted jobs.
    pub max_inactive: Duration,
    /// Completed jobs kept in the registry.
    pub max_completed: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            max_inactive: DEFAULT_MAX_INACTIVE,
            max_completed: DEFAULT_MAX_COMPLETED,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    jobs: HashMap<String, Job>,
    by_package: HashMap<String, String>,
    completed: VecDeque<String>,
}

/// Every known job, by id and by package.
#[derive(Debug)]
pub struct JobRegistry {
    state: RwLock<RegistryState>,
    max_completed: usize,
}

impl JobRegistry {
    pub fn new(max_completed: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_completed,
        }
    }

    /// Track `job`. Its package counts as active from now on.
    pub fn register(&self, job: Job) {
        let mut state = self.state.write();
        state
            .by_package
            .insert(job.package_id().to_string(), job.id().to_string());
        state.jobs.insert(job.id().to_string(), job);
    }

    /// Record that `id` finished and evict old completed jobs.
    pub fn mark_completed(&self, id: &str) {
        let mut state = self.state.write();
        if state.jobs.contains_key(id) && !state.completed.iter().any(|c| c == id) {
            state.completed.push_back(id.to_string());
        }
        let now = Utc::now();
        while state.completed.len() > self.max_completed {
            let Some(oldest) = state.completed.front().cloned() else {
                break;
            };
            let inactive = state
                .jobs
                .get(&oldest)
                .is_none_or(|job| job.is_inactive_at(now));
            if !inactive {
                break;
            }
            state.completed.pop_front();
            if let Some(job) = state.jobs.remove(&oldest) {
                if state.by_package.get(job.package_id()) == Some(&oldest) {
                    state.by_package.remove(job.package_id());
                }
                debug!(job_id = %oldest, "Evicted completed job");
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.state.read().jobs.get(id).cloned()
    }

    /// The latest job registered for `package_id`.
    pub fn for_package(&self, package_id: &str) -> Option<Job> {
        let state = self.state.read();
        state
            .by_package
            .get(package_id)
            .and_then(|id| state.jobs.get(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn completed_count(&self) -> usize {
        self.state.read().completed.len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMPLETED)
    }
}

impl ActivePackages for JobRegistry {
    fn is_active(&self, package_id: &str) -> bool {
        self.state.read().by_package.contains_key(package_id)
    }
}

struct Lane {
    sender: mpsc::UnboundedSender<Job>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
}

impl Lane {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

/// Runs jobs on a pool of tokio workers.
pub struct JobManager {
    registry: Arc<JobRegistry>,
    settings: JobSettings,
    fast: Lane,
    slow: Lane,
    waiting: Arc<AtomicUsize>,
    finished: Arc<watch::Sender<u64>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(registry: Arc<JobRegistry>, settings: JobSettings) -> Self {
        let (finished, _) = watch::channel(0);
        Self {
            registry,
            settings,
            fast: Lane::new(),
            slow: Lane::new(),
            waiting: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(finished),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Spawn the workers. Jobs submitted earlier stay queued until then.
    ///
    /// Returns `false` when the workers were already started.
    pub fn start(&self) -> bool {
        let (Some(fast), Some(slow)) = (self.fast.receiver.lock().take(), self.slow.receiver.lock().take())
        else {
            return false;
        };

        let fast = Arc::new(tokio::sync::Mutex::new(fast));
        let slow = Arc::new(tokio::sync::Mutex::new(slow));
        let mut handles = self.handles.lock();
        for worker in 0..self.settings.workers.max(1) {
            handles.push(self.spawn_worker(format!("fast-{worker}"), Arc::clone(&fast)));
        }
        handles.push(self.spawn_worker("slow".to_string(), slow));
        info!(workers = self.settings.workers.max(1), "Job workers started");
        true
    }

    fn spawn_worker(
        &self,
        name: String,
        queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let waiting = Arc::clone(&self.waiting);
        let finished = Arc::clone(&self.finished);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    job = async { queue.lock().await.recv().await } => job,
                };
                let Some(job) = next else {
                    break;
                };
                waiting.fetch_sub(1, Ordering::SeqCst);
                debug!(worker = %name, job_id = %job.id(), "Starting job");

                let running = job.clone();
                let outcome = tokio::task::spawn_blocking(move || match &running {
                    Job::Pipeline(job) => process_pipeline_job(job),
                    Job::Step(job) => process_step_job(job),
                })
                .await;
                if let Err(e) = outcome {
                    error!(worker = %name, job_id = %job.id(), error = %e, "Job panicked");
                    match &job {
                        Job::Pipeline(j) => j.failed("job panicked"),
                        Job::Step(j) => j.failed("job panicked"),
                    }
                }

                registry.mark_completed(job.id());
                finished.send_modify(|count| *count += 1);
                debug!(worker = %name, job_id = %job.id(), status = %job.status().state(), "Job finished");
            }
            debug!(worker = %name, "Job worker stopped");
        })
    }

    /// Register and enqueue a pipeline job. Returns the job id.
    pub fn submit_pipeline(&self, job: PipelineJob) -> Result<Arc<PipelineJob>> {
        let job = Arc::new(job.with_max_inactive(self.settings.max_inactive));
        self.submit(Job::Pipeline(Arc::clone(&job)))?;
        Ok(job)
    }

    /// Register and enqueue a single-step job.
    pub fn submit_step(&self, job: StepJob) -> Result<Arc<StepJob>> {
        let job = Arc::new(job.with_max_inactive(self.settings.max_inactive));
        self.submit(Job::Step(Arc::clone(&job)))?;
        Ok(job)
    }

    fn submit(&self, job: Job) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Shutdown);
        }
        self.registry.register(job.clone());
        self.waiting.fetch_add(1, Ordering::SeqCst);

        let lane = if job.is_slow() { &self.slow } else { &self.fast };
        let id = job.id().to_string();
        let package_id = job.package_id().to_string();
        if let Err(mpsc::error::SendError(job)) = lane.sender.send(job) {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            match &job {
                Job::Pipeline(j) => j.failed("job manager is shut down"),
                Job::Step(j) => j.failed("job manager is shut down"),
            }
            self.registry.mark_completed(&id);
            return Err(PipelineError::Shutdown);
        }
        info!(job_id = %id, package_id = %package_id, "Job submitted");
        Ok(())
    }

    pub fn status(&self, id: &str) -> Option<JobStatus> {
        self.registry.get(id).map(|job| job.status())
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.registry.get(id)
    }

    pub fn job_for_package(&self, package_id: &str) -> Option<Job> {
        self.registry.for_package(package_id)
    }

    /// Jobs queued but not yet picked up by a worker.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait until job `id` has completed and return its final status.
    pub async fn wait_for(&self, id: &str) -> Result<JobStatus> {
        let mut finished = self.finished.subscribe();
        loop {
            let job = self
                .registry
                .get(id)
                .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))?;
            let status = job.status();
            if status.has_completed() {
                return Ok(status);
            }
            tokio::select! {
                changed = finished.changed() => {
                    if changed.is_err() {
                        return Err(PipelineError::Shutdown);
                    }
                }
                _ = self.cancel.cancelled() => return Err(PipelineError::Shutdown),
            }
        }
    }

    /// Stop the workers. A job already on a worker finishes first; queued
    /// jobs stay unprocessed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job worker ended abnormally");
            }
        }
        info!("Job workers stopped");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run every step of the job's pipeline in order.
pub fn process_pipeline_job(job: &PipelineJob) {
    let model = Arc::clone(job.model());
    let pipeline = Arc::clone(job.pipeline());
    let total = pipeline.len();
    job.started();
    info!(
        job_id = %job.id(),
        model = %model.name(),
        pipeline = %pipeline.id(),
        package_id = %job.package_id(),
        steps = total,
        "Processing pipeline"
    );

    for (index, step) in pipeline.steps().iter().enumerate() {
        job.set_percentage(progress(index, total));
        job.set_message(format!("Running step '{}'", step.name()));

        let mut package = job.package();
        let result = step.exec(&model, &pipeline, &mut package);
        let download = result
            .downloadable
            .clone()
            .filter(|_| result.is_ok())
            .and_then(|path| download_path(&package, &path));
        drop(package);

        let error = result.is_error().then(|| {
            result
                .error
                .clone()
                .unwrap_or_else(|| format!("step '{}' failed", step.id()))
        });
        job.add_result(result);
        job.set_percentage(progress(index + 1, total));
        if let Some(path) = download {
            job.set_download_path(path);
        }

        if let Some(message) = error {
            if step.fail_on_error() {
                warn!(job_id = %job.id(), step = %step.id(), error = %message, "Pipeline stopped");
                persist_package(job.id(), &job.package());
                job.failed(&message);
                return;
            }
            debug!(job_id = %job.id(), step = %step.id(), "Ignoring step error");
        }
    }

    persist_package(job.id(), &job.package());
    job.completed();
    info!(job_id = %job.id(), "Pipeline completed");
}

/// Run the job's single step.
pub fn process_step_job(job: &StepJob) {
    let model = Arc::clone(job.model());
    let pipeline = Arc::clone(job.pipeline());
    let Some(step) = job.step() else {
        job.failed("step not found");
        return;
    };
    job.started();

    let mut package = job.package();
    let result = step.exec(&model, &pipeline, &mut package);
    if let Some(path) = result
        .downloadable
        .clone()
        .filter(|_| result.is_ok())
        .and_then(|path| download_path(&package, &path))
    {
        job.set_download_path(path);
    }
    persist_package(job.id(), &package);
    drop(package);

    if result.is_error() {
        let message = result.error.clone().unwrap_or_else(|| "step failed".to_string());
        job.set_result(result);
        job.failed(&message);
    } else {
        job.set_result(result);
        job.completed();
    }
}

/// Save property and parameter writes; a failed save is logged, not fatal.
fn persist_package(job_id: &str, package: &PackageData) {
    if let Err(e) = package.persist() {
        warn!(job_id = %job_id, error = %e, "Failed to save package properties");
    }
}

fn progress(done: usize, total: usize) -> i32 {
    if total == 0 {
        return 100;
    }
    i32::try_from(done * 100 / total).unwrap_or(100)
}

/// Download path of `file`: `<package-id>/<relative path>`.
///
/// Files outside the package are copied into its download directory first.
fn download_path(package: &PackageData, file: &Path) -> Option<String> {
    let file = if file.is_relative() {
        package.directory().join(file)
    } else {
        file.to_path_buf()
    };
    if !file.exists() {
        warn!(package_id = %package.id(), file = %file.display(), "Downloadable output missing");
        return None;
    }
    if let Some(relative) = package.relative_path(&file) {
        return Some(format!("{}/{}", package.id(), relative));
    }
    if !file.is_file() {
        warn!(package_id = %package.id(), file = %file.display(), "Cannot offer a directory outside the package");
        return None;
    }

    let name = file.file_name()?;
    let copied = match package.download_dir() {
        Ok(dir) => dir.join(name),
        Err(e) => {
            warn!(package_id = %package.id(), error = %e, "Cannot create download directory");
            return None;
        }
    };
    if let Err(e) = fs::copy(&file, &copied) {
        warn!(package_id = %package.id(), file = %file.display(), error = %e, "Cannot copy downloadable output");
        return None;
    }
    package
        .relative_path(&copied)
        .map(|relative| format!("{}/{}", package.id(), relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::model::Model;
    use crate::registry::StepRegistry;
    use crate::result::StepResult;
    use crate::step::{Step, StepInfo};
    use oxpipe_store::PackageStore;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        model: Arc<Model>,
        store: PackageStore,
    }

    fn fixture(xml: &str) -> Fixture {
        fixture_with(xml, StepRegistry::with_builtins())
    }

    fn fixture_with(xml: &str, registry: StepRegistry) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let models = tmp.path().join("models");
        fs::create_dir_all(models.join("demo")).unwrap();
        fs::write(models.join("demo").join("model.xml"), xml).unwrap();
        let model = Arc::new(Model::new(&models, "demo", Arc::new(registry)));
        let store = PackageStore::new(tmp.path().join("packages")).unwrap();
        Fixture {
            _tmp: tmp,
            model,
            store,
        }
    }

    const PIPELINE: &str = r#"<model><pipeline id="p" name="P"><step id="a"/><step id="b"/></pipeline></model>"#;

    fn pipeline_job(fx: &Fixture) -> PipelineJob {
        let package = fx.store.new_package("demo", None).unwrap();
        PipelineJob::new(Arc::clone(&fx.model), fx.model.pipeline("p").unwrap(), package)
    }

    #[test]
    fn test_registry_tracks_packages() {
        let fx = fixture(PIPELINE);
        let registry = JobRegistry::new(10);
        let job = Arc::new(pipeline_job(&fx));
        registry.register(Job::Pipeline(Arc::clone(&job)));

        assert!(registry.is_active(job.package_id()));
        assert!(!registry.is_active("OTHER"));
        assert_eq!(registry.for_package(job.package_id()).unwrap().id(), job.id());
        assert_eq!(registry.get(job.id()).unwrap().package_id(), job.package_id());
    }

    #[test]
    fn test_registry_evicts_only_inactive_overflow() {
        let fx = fixture(PIPELINE);
        let registry = JobRegistry::new(1);

        let old = Arc::new(pipeline_job(&fx).with_max_inactive(Duration::ZERO));
        registry.register(Job::Pipeline(Arc::clone(&old)));
        registry.mark_completed(old.id());
        std::thread::sleep(Duration::from_millis(5));

        let fresh = Arc::new(pipeline_job(&fx));
        registry.register(Job::Pipeline(Arc::clone(&fresh)));
        registry.mark_completed(fresh.id());

        assert!(registry.get(old.id()).is_none());
        assert!(!registry.is_active(old.package_id()));
        assert!(registry.get(fresh.id()).is_some());

        let another = Arc::new(pipeline_job(&fx));
        registry.register(Job::Pipeline(Arc::clone(&another)));
        registry.mark_completed(another.id());
        assert_eq!(registry.completed_count(), 2);
        assert!(registry.get(fresh.id()).is_some());
    }

    #[test]
    fn test_process_pipeline_job() {
        let fx = fixture(PIPELINE);
        let job = pipeline_job(&fx);
        process_pipeline_job(&job);

        let status = job.status();
        assert!(status.has_completed());
        assert_eq!(status.percentage(), 100);
        let ids: Vec<_> = job.results().iter().map(|r| r.step_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    struct TagStep;

    impl Step for TagStep {
        fn process(
            &self,
            model: &Model,
            package: &mut PackageData,
            info: &StepInfo,
        ) -> anyhow::Result<StepResult> {
            package.set_property("output", "doc.xml");
            Ok(StepResult::new(model.name(), package, info))
        }
    }

    struct BrokenStep;

    impl Step for BrokenStep {
        fn process(&self, _: &Model, _: &mut PackageData, _: &StepInfo) -> anyhow::Result<StepResult> {
            anyhow::bail!("converter crashed")
        }
    }

    fn tagging_registry() -> StepRegistry {
        let mut registry = StepRegistry::with_builtins();
        registry
            .register_step("tag", || Arc::new(TagStep) as Arc<dyn Step>)
            .unwrap();
        registry
            .register_step("broken", || Arc::new(BrokenStep) as Arc<dyn Step>)
            .unwrap();
        registry
    }

    const TAGGING: &str = r#"<model>
  <pipeline id="strict" name="Strict">
    <step id="tag" class="tag"/>
    <step id="boom" class="broken"/>
    <step id="never"/>
  </pipeline>
  <pipeline id="lenient" name="Lenient">
    <step id="tag" class="tag"/>
    <step id="boom" class="broken" fail-on-error="false"/>
  </pipeline>
</model>"#;

    #[test]
    fn test_failed_pipeline_still_saves_package() {
        let fx = fixture_with(TAGGING, tagging_registry());
        let package = fx.store.new_package("demo", None).unwrap();
        let job = PipelineJob::new(Arc::clone(&fx.model), fx.model.pipeline("strict").unwrap(), package);
        process_pipeline_job(&job);

        assert_eq!(job.status().state(), JobState::Error);
        assert_eq!(job.results().len(), 2);
        let reopened = fx.store.get_package(job.package_id()).unwrap();
        assert_eq!(reopened.property("output"), Some("doc.xml"));
    }

    #[test]
    fn test_ignored_step_error_completes_and_saves() {
        let fx = fixture_with(TAGGING, tagging_registry());
        let package = fx.store.new_package("demo", None).unwrap();
        let job = PipelineJob::new(Arc::clone(&fx.model), fx.model.pipeline("lenient").unwrap(), package);
        process_pipeline_job(&job);

        assert_eq!(job.status().state(), JobState::Completed);
        let reopened = fx.store.get_package(job.package_id()).unwrap();
        assert_eq!(reopened.property("output"), Some("doc.xml"));
    }

    #[test]
    fn test_progress() {
        assert_eq!(progress(0, 3), 0);
        assert_eq!(progress(1, 3), 33);
        assert_eq!(progress(3, 3), 100);
        assert_eq!(progress(0, 0), 100);
    }

    #[test]
    fn test_download_path_inside_and_outside() {
        let tmp = TempDir::new().unwrap();
        let store = PackageStore::new(tmp.path().join("packages")).unwrap();
        let package = store.new_package("demo", None).unwrap();

        let inside = package.directory().join("out").join("r.xml");
        fs::create_dir_all(inside.parent().unwrap()).unwrap();
        fs::write(&inside, "<r/>").unwrap();
        assert_eq!(
            download_path(&package, &inside),
            Some(format!("{}/out/r.xml", package.id()))
        );
        assert_eq!(
            download_path(&package, Path::new("out/r.xml")),
            Some(format!("{}/out/r.xml", package.id()))
        );

        let outside = tmp.path().join("elsewhere.txt");
        fs::write(&outside, "hi").unwrap();
        assert_eq!(
            download_path(&package, &outside),
            Some(format!("{}/download/elsewhere.txt", package.id()))
        );
        assert!(package.directory().join("download").join("elsewhere.txt").is_file());

        assert_eq!(download_path(&package, Path::new("missing.xml")), None);
    }

    #[tokio::test]
    async fn test_manager_runs_jobs() {
        let fx = fixture(PIPELINE);
        let registry = Arc::new(JobRegistry::default());
        let manager = JobManager::new(Arc::clone(&registry), JobSettings::default());

        let queued = manager.submit_pipeline(pipeline_job(&fx)).unwrap();
        assert_eq!(manager.waiting(), 1);
        assert!(registry.is_active(queued.package_id()));

        assert!(manager.start());
        assert!(!manager.start());
        let slow = manager.submit_pipeline(pipeline_job(&fx).with_slow(true)).unwrap();

        let status = manager.wait_for(queued.id()).await.unwrap();
        assert!(status.has_completed());
        let status = manager.wait_for(slow.id()).await.unwrap();
        assert!(status.has_completed());
        assert_eq!(manager.waiting(), 0);
        assert!(manager.job_for_package(slow.package_id()).is_some());

        manager.shutdown().await;
        assert!(matches!(
            manager.submit_pipeline(pipeline_job(&fx)),
            Err(PipelineError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_job() {
        let manager = JobManager::new(Arc::new(JobRegistry::default()), JobSettings::default());
        assert!(matches!(
            manager.wait_for("nope").await,
            Err(PipelineError::JobNotFound(_))
        ));
    }
}
