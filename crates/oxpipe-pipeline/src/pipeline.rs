//! Pipelines: ordered step definitions accepting one media type.

use std::fmt;

use oxpipe_store::XmlElement;
use tracing::warn;

use crate::definition::StepDefinition;
use crate::error::{PipelineError, Result};

/// Media type accepted when a pipeline does not declare one.
pub const DEFAULT_ACCEPTS: &str = "application/xml";

pub struct Pipeline {
    model: String,
    id: String,
    name: String,
    accepts: String,
    description: Option<String>,
    default: bool,
    steps: Vec<StepDefinition>,
    extra_attributes: Vec<(String, String)>,
    extra_elements: Vec<XmlElement>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("model", &self.model)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("accepts", &self.accepts)
            .field("default", &self.default)
            .field("steps", &self.steps.iter().map(StepDefinition::id).collect::<Vec<_>>())
            .finish()
    }
}

impl Pipeline {
    /// Create an empty pipeline.
    ///
    /// `name` is required. A blank `id` falls back to the name with a
    /// warning; a blank `accepts` selects [`DEFAULT_ACCEPTS`].
    pub fn new(model: &str, id: Option<&str>, name: &str, accepts: Option<&str>) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "pipeline in model '{model}' has no name"
            )));
        }
        let id = match id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                warn!(model = %model, pipeline = %name, "Pipeline has no id, using its name");
                name.to_string()
            }
        };
        let accepts = accepts
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(DEFAULT_ACCEPTS);

        Ok(Self {
            model: model.to_string(),
            id,
            name: name.to_string(),
            accepts: accepts.to_string(),
            description: None,
            default: false,
            steps: Vec::new(),
            extra_attributes: Vec::new(),
            extra_elements: Vec::new(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into()).filter(|d| !d.trim().is_empty());
        self
    }

    pub fn with_default(mut self, default: bool) -> Self {
        self.default = default;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accepted media type.
    pub fn accepts(&self) -> &str {
        &self.accepts
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    /// Append a step. Fails without modifying the pipeline when the id is
    /// already taken.
    pub fn add_step(&mut self, mut step: StepDefinition) -> Result<()> {
        if self.step(step.id()).is_some() {
            return Err(PipelineError::DuplicateId {
                kind: "step",
                id: step.id().to_string(),
                parent: format!("pipeline '{}'", self.id),
            });
        }
        step.index = self.steps.len();
        step.model = self.model.clone();
        step.pipeline = self.id.clone();
        self.steps.push(step);
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id() == id)
    }

    pub fn step_at(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep an unrecognized attribute. Names are unique per pipeline.
    pub fn add_extra_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.extra_attributes.iter().any(|(n, _)| *n == name) {
            return Err(PipelineError::DuplicateId {
                kind: "attribute",
                id: name,
                parent: format!("pipeline '{}'", self.id),
            });
        }
        self.extra_attributes.push((name, value.into()));
        Ok(())
    }

    pub fn add_extra_element(&mut self, element: XmlElement) {
        self.extra_elements.push(element);
    }

    pub fn extra_attributes(&self) -> &[(String, String)] {
        &self.extra_attributes
    }

    pub fn extra_elements(&self) -> &[XmlElement] {
        &self.extra_elements
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut el = XmlElement::new("pipeline")
            .attr("id", &self.id)
            .attr("name", &self.name)
            .attr("accepts", &self.accepts)
            .attr("default", self.default)
            .attr_opt("description", self.description.as_deref());
        for (name, value) in &self.extra_attributes {
            el = el.attr(name, value);
        }
        for extra in &self.extra_elements {
            el.push(extra.clone());
        }
        for step in &self.steps {
            el.push(step.to_xml(None));
        }
        el
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinitionBuilder;
    use crate::registry::StepRegistry;

    fn step(id: &str) -> StepDefinition {
        StepDefinitionBuilder::new(id)
            .build(&StepRegistry::with_builtins())
            .unwrap()
    }

    #[test]
    fn test_new_defaults() {
        let p = Pipeline::new("demo", Some("main"), "Main", None).unwrap();
        assert_eq!(p.id(), "main");
        assert_eq!(p.accepts(), DEFAULT_ACCEPTS);
        assert!(!p.is_default());
        assert!(p.is_empty());
    }

    #[test]
    fn test_id_falls_back_to_name() {
        let p = Pipeline::new("demo", Some("  "), "Legacy", Some("text/plain")).unwrap();
        assert_eq!(p.id(), "Legacy");
        assert_eq!(p.accepts(), "text/plain");
    }

    #[test]
    fn test_name_required() {
        let err = Pipeline::new("demo", Some("main"), " ", None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_add_step_assigns_index() {
        let mut p = Pipeline::new("demo", Some("main"), "Main", None).unwrap();
        p.add_step(step("a")).unwrap();
        p.add_step(step("b")).unwrap();

        let b = p.step("b").unwrap();
        assert_eq!(b.index(), 1);
        assert_eq!(b.model(), "demo");
        assert_eq!(b.pipeline_id(), "main");
        assert_eq!(b.previous(&p).unwrap().id(), "a");
        assert!(b.next(&p).is_none());
        assert!(std::ptr::eq(p.step_at(0).unwrap(), p.step("a").unwrap()));
    }

    #[test]
    fn test_duplicate_step_leaves_list_unchanged() {
        let mut p = Pipeline::new("demo", Some("main"), "Main", None).unwrap();
        p.add_step(step("a")).unwrap();
        let err = p.add_step(step("a")).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateId { kind: "step", .. }));
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_duplicate_extra_attribute() {
        let mut p = Pipeline::new("demo", Some("main"), "Main", None).unwrap();
        p.add_extra_attribute("owner", "ops").unwrap();
        assert!(p.add_extra_attribute("owner", "dev").is_err());
        assert_eq!(p.extra_attributes(), &[("owner".to_string(), "ops".to_string())]);
    }

    #[test]
    fn test_to_xml() {
        let mut p = Pipeline::new("demo", Some("main"), "Main", None)
            .unwrap()
            .with_description("Does things")
            .with_default(true);
        p.add_step(step("a")).unwrap();
        let el = p.to_xml();
        assert_eq!(el.attribute("default"), Some("true"));
        assert_eq!(el.attribute("description"), Some("Does things"));
        assert_eq!(el.find("step").unwrap().attribute("id"), Some("a"));
    }
}
