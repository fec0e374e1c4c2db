//! Models: named collections of pipelines backed by a directory.
//!
//! A model lives in `<models-root>/<name>/` and is defined by the
//! `model.xml` file in that directory. Loading is lazy and happens once;
//! [`Model::reload`] re-reads the definition. Load failures never escape as
//! errors: they are logged and leave the model without pipelines.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use oxpipe_store::{PropertyStore, XmlElement};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::loader::{self, MODEL_FILE};
use crate::pipeline::Pipeline;
use crate::registry::StepRegistry;

#[derive(Debug, Default)]
struct ModelState {
    attempted: bool,
    loaded: bool,
    attributes: Vec<(String, String)>,
    pipelines: Vec<Arc<Pipeline>>,
}

#[derive(Debug)]
pub struct Model {
    name: String,
    directory: PathBuf,
    registry: Arc<StepRegistry>,
    state: RwLock<ModelState>,
}

impl Model {
    /// A model named `name` under `models_dir`. Nothing is read yet.
    pub fn new(models_dir: &Path, name: impl Into<String>, registry: Arc<StepRegistry>) -> Self {
        let name = name.into();
        Self {
            directory: models_dir.join(&name),
            name,
            registry,
            state: RwLock::new(ModelState::default()),
        }
    }

    /// Whether `models_dir` holds a definition for `name`.
    pub fn is_defined(models_dir: &Path, name: &str) -> bool {
        Self::is_valid_name(name) && models_dir.join(name).join(MODEL_FILE).is_file()
    }

    /// A model name is a single path segment below the models root.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
    }

    /// Names of all models defined under `models_dir`, sorted.
    pub fn list(models_dir: &Path) -> Result<Vec<String>> {
        let entries = fs::read_dir(models_dir).map_err(|source| PipelineError::Io {
            path: models_dir.display().to_string(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(MODEL_FILE).is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the definition file.
    pub fn definition_file(&self) -> PathBuf {
        self.directory.join(MODEL_FILE)
    }

    /// Load the definition unless that was already attempted.
    ///
    /// Returns whether the model is loaded.
    pub fn load(&self) -> bool {
        {
            let state = self.state.read();
            if state.attempted {
                return state.loaded;
            }
        }
        let mut state = self.state.write();
        if state.attempted {
            return state.loaded;
        }
        self.load_into(&mut state)
    }

    /// Re-read the definition, replacing whatever was loaded.
    pub fn reload(&self) -> bool {
        let mut state = self.state.write();
        self.load_into(&mut state)
    }

    fn load_into(&self, state: &mut ModelState) -> bool {
        state.attempted = true;
        match self.read_definition() {
            Ok(definition) => {
                info!(
                    model = %self.name,
                    pipelines = definition.pipelines.len(),
                    "Model loaded"
                );
                state.loaded = true;
                state.attributes = definition.attributes;
                state.pipelines = definition.pipelines.into_iter().map(Arc::new).collect();
            }
            Err(e) => {
                warn!(model = %self.name, error = %e, "Failed to load model");
                state.loaded = false;
                state.attributes.clear();
                state.pipelines.clear();
            }
        }
        state.loaded
    }

    fn read_definition(&self) -> Result<loader::ModelDefinition> {
        let path = self.definition_file();
        let file = File::open(&path).map_err(|source| PipelineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        loader::parse(
            &self.name,
            &path.display().to_string(),
            BufReader::new(file),
            &self.registry,
        )
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().loaded
    }

    /// Pipelines in declaration order. Loads the model on first use.
    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.load();
        self.state.read().pipelines.clone()
    }

    pub fn pipeline(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.load();
        self.state
            .read()
            .pipelines
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    /// The first pipeline flagged as default, otherwise the first one.
    pub fn default_pipeline(&self) -> Option<Arc<Pipeline>> {
        self.load();
        let state = self.state.read();
        state
            .pipelines
            .iter()
            .find(|p| p.is_default())
            .or_else(|| state.pipelines.first())
            .cloned()
    }

    /// Number of pipelines.
    pub fn len(&self) -> usize {
        self.load();
        self.state.read().pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attributes of the root element.
    pub fn attributes(&self) -> Vec<(String, String)> {
        self.load();
        self.state.read().attributes.clone()
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// A path inside the model directory.
    pub fn file(&self, path: &str) -> PathBuf {
        self.directory.join(path.trim_start_matches(['/', '\\']))
    }

    /// Load a property file shipped with the model.
    pub fn properties(&self, path: &str) -> Result<PropertyStore> {
        Ok(PropertyStore::load(&self.file(path))?)
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut el = XmlElement::new("model").attr("name", &self.name);
        for (name, value) in self.attributes() {
            el = el.attr(name, value);
        }
        for pipeline in self.pipelines() {
            el.push(pipeline.to_xml());
        }
        el
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_model(root: &Path, name: &str, xml: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(MODEL_FILE), xml).unwrap();
    }

    fn registry() -> Arc<StepRegistry> {
        Arc::new(StepRegistry::with_builtins())
    }

    const TWO_PIPELINES: &str = r#"<model owner="ops">
        <pipeline id="a" name="A"><step id="s1"/></pipeline>
        <pipeline id="b" name="B" default="true"><step id="s1"/><step id="s2"/></pipeline>
    </model>"#;

    #[test]
    fn test_load_and_lookup() {
        let tmp = TempDir::new().unwrap();
        write_model(tmp.path(), "demo", TWO_PIPELINES);
        let model = Model::new(tmp.path(), "demo", registry());

        assert!(!model.is_loaded());
        assert!(model.load());
        assert_eq!(model.len(), 2);
        assert_eq!(model.pipeline("b").unwrap().len(), 2);
        assert_eq!(model.default_pipeline().unwrap().id(), "b");
        assert_eq!(model.attribute("owner").as_deref(), Some("ops"));
        assert!(model.pipeline("missing").is_none());
    }

    #[test]
    fn test_load_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write_model(tmp.path(), "demo", TWO_PIPELINES);
        let model = Model::new(tmp.path(), "demo", registry());
        assert!(model.load());
        let first = model.pipeline("a").unwrap();

        write_model(tmp.path(), "demo", r#"<model><pipeline id="c" name="C"/></model>"#);
        assert!(model.load());
        assert!(Arc::ptr_eq(&first, &model.pipeline("a").unwrap()));

        assert!(model.reload());
        assert!(model.pipeline("a").is_none());
        assert!(model.pipeline("c").is_some());
    }

    #[test]
    fn test_missing_definition() {
        let tmp = TempDir::new().unwrap();
        let model = Model::new(tmp.path(), "ghost", registry());
        assert!(!model.load());
        assert!(model.is_empty());
        assert!(model.default_pipeline().is_none());
    }

    #[test]
    fn test_failed_reload_clears_pipelines() {
        let tmp = TempDir::new().unwrap();
        write_model(tmp.path(), "demo", TWO_PIPELINES);
        let model = Model::new(tmp.path(), "demo", registry());
        assert!(model.load());

        write_model(tmp.path(), "demo", r#"<model><pipeline id="a" name="A"><step id="x" class="nope"/></pipeline></model>"#);
        assert!(!model.reload());
        assert!(!model.is_loaded());
        assert_eq!(model.len(), 0);
    }

    #[test]
    fn test_default_pipeline_falls_back_to_first() {
        let tmp = TempDir::new().unwrap();
        write_model(
            tmp.path(),
            "demo",
            r#"<model><pipeline id="x" name="X"/><pipeline id="y" name="Y"/></model>"#,
        );
        let model = Model::new(tmp.path(), "demo", registry());
        assert_eq!(model.default_pipeline().unwrap().id(), "x");
    }

    #[test]
    fn test_list_and_is_defined() {
        let tmp = TempDir::new().unwrap();
        write_model(tmp.path(), "beta", TWO_PIPELINES);
        write_model(tmp.path(), "alpha", TWO_PIPELINES);
        fs::create_dir_all(tmp.path().join("not-a-model")).unwrap();

        assert_eq!(Model::list(tmp.path()).unwrap(), vec!["alpha", "beta"]);
        assert!(Model::is_defined(tmp.path(), "alpha"));
        assert!(!Model::is_defined(tmp.path(), "not-a-model"));
        assert!(Model::list(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_model_files_and_properties() {
        let tmp = TempDir::new().unwrap();
        write_model(tmp.path(), "demo", TWO_PIPELINES);
        fs::write(tmp.path().join("demo").join("labels.properties"), "title=Demo\n").unwrap();
        let model = Model::new(tmp.path(), "demo", registry());

        assert_eq!(model.file("/labels.properties"), tmp.path().join("demo").join("labels.properties"));
        let props = model.properties("labels.properties").unwrap();
        assert_eq!(props.get("title"), Some("Demo"));
        assert!(model.properties("missing.properties").is_err());
    }

    #[test]
    fn test_to_xml() {
        let tmp = TempDir::new().unwrap();
        write_model(tmp.path(), "demo", TWO_PIPELINES);
        let model = Model::new(tmp.path(), "demo", registry());
        let el = model.to_xml();
        assert_eq!(el.attribute("name"), Some("demo"));
        assert_eq!(el.attribute("owner"), Some("ops"));
        assert_eq!(el.children.len(), 2);
    }
}
