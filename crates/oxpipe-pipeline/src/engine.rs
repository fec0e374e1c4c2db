//! Orchestration root.
//!
//! [`Engine`] owns the package store, the model catalog, the job manager and
//! the cleanup service, all configured from one [`OxConfig`]. The job
//! registry is shared between the manager and the cleanup service so that
//! packages of tracked jobs are never reclaimed.

use std::path::Path;
use std::sync::Arc;

use oxpipe_config::OxConfig;
use oxpipe_store::{
    ActivePackages, CleanupService, CleanupSettings, PackageData, PackageStore, StoreError,
};
use tracing::info;

use crate::catalog::ModelCatalog;
use crate::error::{PipelineError, Result};
use crate::job::{PipelineJob, StepJob};
use crate::manager::{JobManager, JobRegistry, JobSettings};
use crate::model::Model;
use crate::pipeline::Pipeline;
use crate::registry::StepRegistry;

pub struct Engine {
    store: Arc<PackageStore>,
    catalog: Arc<ModelCatalog>,
    jobs: Arc<JobRegistry>,
    manager: JobManager,
    cleanup: CleanupService,
    cleanup_enabled: bool,
}

impl Engine {
    /// Build all services. Nothing runs until [`Engine::start`].
    pub fn new(config: &OxConfig, registry: StepRegistry) -> Result<Self> {
        let temp_dir = config.temp_dir();
        let store = Arc::new(PackageStore::new(&temp_dir)?);
        let catalog = Arc::new(ModelCatalog::new(config.models_dir(), Arc::new(registry)));

        let jobs_config = config.jobs();
        let jobs = Arc::new(JobRegistry::new(jobs_config.max_completed_jobs));
        let manager = JobManager::new(
            Arc::clone(&jobs),
            JobSettings {
                workers: jobs_config.workers,
                max_inactive: jobs_config.max_inactive(),
                max_completed: jobs_config.max_completed_jobs,
            },
        );

        let cleanup_config = config.cleanup();
        let settings = CleanupSettings::new(&temp_dir)
            .with_max_inactive(cleanup_config.max_inactive())
            .with_delay(cleanup_config.delay())
            .with_initial_delay(cleanup_config.initial_delay())
            .with_ignore(cleanup_config.ignore.clone());
        let cleanup = CleanupService::new(settings, Arc::clone(&jobs) as Arc<dyn ActivePackages>)?;

        Ok(Self {
            store,
            catalog,
            jobs,
            manager,
            cleanup,
            cleanup_enabled: cleanup_config.enabled,
        })
    }

    pub fn store(&self) -> &Arc<PackageStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    pub fn cleanup(&self) -> &CleanupService {
        &self.cleanup
    }

    /// Start the job workers and, when enabled, the cleanup loop.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        self.manager.start();
        if self.cleanup_enabled {
            self.cleanup.start();
        }
        info!(
            packages = %self.store.root().display(),
            models = %self.catalog.models_dir().display(),
            cleanup = self.cleanup_enabled,
            "Engine started"
        );
    }

    /// A loaded model, or an error when it is unknown or failed to load.
    pub fn model(&self, name: &str) -> Result<Arc<Model>> {
        let model = self.catalog.get(name)?;
        if !model.is_loaded() {
            return Err(PipelineError::Configuration(format!(
                "model '{name}' failed to load"
            )));
        }
        Ok(model)
    }

    /// `pipeline` of `model`, or its default pipeline.
    pub fn pipeline(&self, model: &Model, pipeline: Option<&str>) -> Result<Arc<Pipeline>> {
        let found = match pipeline {
            Some(id) => model.pipeline(id),
            None => model.default_pipeline(),
        };
        found.ok_or_else(|| PipelineError::PipelineNotFound {
            model: model.name().to_string(),
            pipeline: pipeline.unwrap_or("<default>").to_string(),
        })
    }

    pub fn package(&self, id: &str) -> Result<PackageData> {
        self.store
            .get_package(id)
            .ok_or_else(|| StoreError::PackageNotFound(id.to_string()).into())
    }

    /// Create a package from `file` and queue a pipeline run on it.
    ///
    /// `parameters` become package parameters; the package is persisted
    /// before the job is queued.
    pub fn submit(
        &self,
        model: &str,
        pipeline: Option<&str>,
        file: Option<&Path>,
        parameters: &[(String, String)],
        slow: bool,
    ) -> Result<Arc<PipelineJob>> {
        let model = self.model(model)?;
        let pipeline = self.pipeline(&model, pipeline)?;

        let mut package = self.store.new_package(model.name(), file)?;
        for (name, value) in parameters {
            package.set_parameter(name, value.as_str());
        }
        package.persist()?;

        let job = PipelineJob::new(model, pipeline, package).with_slow(slow);
        self.manager.submit_pipeline(job)
    }

    /// Queue a single step on an existing package.
    pub fn submit_step(
        &self,
        model: &str,
        pipeline: &str,
        step: &str,
        package_id: &str,
    ) -> Result<Arc<StepJob>> {
        let model = self.model(model)?;
        let pipeline = self.pipeline(&model, Some(pipeline))?;
        let package = self.package(package_id)?;
        let job = {
            let definition = pipeline.step(step).ok_or_else(|| PipelineError::StepNotFound {
                pipeline: pipeline.id().to_string(),
                step: step.to_string(),
            })?;
            StepJob::new(Arc::clone(&model), Arc::clone(&pipeline), definition, package)
        };
        self.manager.submit_step(job)
    }

    /// Stop the cleanup loop and the job workers.
    pub async fn shutdown(&self) {
        self.cleanup.stop().await;
        self.manager.shutdown().await;
        info!("Engine stopped");
    }
}
