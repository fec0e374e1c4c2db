//! Cached access to the models under one models root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::model::Model;
use crate::registry::StepRegistry;

/// Lazily loaded, shared models.
#[derive(Debug)]
pub struct ModelCatalog {
    models_dir: PathBuf,
    registry: Arc<StepRegistry>,
    cache: RwLock<BTreeMap<String, Arc<Model>>>,
}

impl ModelCatalog {
    pub fn new(models_dir: impl Into<PathBuf>, registry: Arc<StepRegistry>) -> Self {
        Self {
            models_dir: models_dir.into(),
            registry,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Names of the models on disk, sorted.
    pub fn names(&self) -> Vec<String> {
        match Model::list(&self.models_dir) {
            Ok(names) => names,
            Err(e) => {
                warn!(models_dir = %self.models_dir.display(), error = %e, "Cannot list models");
                Vec::new()
            }
        }
    }

    /// The model called `name`, loading it on first access.
    ///
    /// A model whose definition fails to parse is still returned; it simply
    /// has no pipelines.
    pub fn get(&self, name: &str) -> Result<Arc<Model>> {
        if let Some(model) = self.cache.read().get(name) {
            return Ok(Arc::clone(model));
        }
        if !Model::is_defined(&self.models_dir, name) {
            return Err(PipelineError::ModelNotFound(name.to_string()));
        }

        let mut cache = self.cache.write();
        let model = cache
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(model = %name, "Caching model");
                Arc::new(Model::new(&self.models_dir, name, Arc::clone(&self.registry)))
            })
            .clone();
        drop(cache);

        model.load();
        Ok(model)
    }

    /// All models on disk.
    pub fn models(&self) -> Vec<Arc<Model>> {
        self.names()
            .iter()
            .filter_map(|name| self.get(name).ok())
            .collect()
    }

    /// Re-read one model's definition.
    pub fn reload(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.reload())
    }

    /// Drop cached models that disappeared and re-read the others.
    pub fn reload_all(&self) -> usize {
        let names = self.names();
        self.cache.write().retain(|name, _| names.contains(name));
        names
            .iter()
            .filter_map(|name| self.get(name).ok())
            .filter(|model| model.reload())
            .count()
    }

    /// The first model, by name.
    pub fn default_model(&self) -> Option<Arc<Model>> {
        self.names().first().and_then(|name| self.get(name).ok())
    }
}
