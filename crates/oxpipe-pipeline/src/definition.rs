//! Step definitions and single-step execution.
//!
//! A [`StepDefinition`] is one `<step>` of a pipeline: its identity, the
//! implementation instances bound to it, its declared output and static
//! parameters. Definitions are built with [`StepDefinitionBuilder`] and get
//! their position assigned when added to a [`Pipeline`].

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use oxpipe_store::{PackageData, XmlElement};
use tracing::{debug, error, warn};

use crate::error::{PipelineError, Result};
use crate::model::Model;
use crate::pipeline::Pipeline;
use crate::registry::{NOP_STEP, StepRegistry};
use crate::result::StepResult;
use crate::step::{CallbackStep, Step, StepInfo};

/// Whether `id` is a valid step id (`[A-Za-z_0-9-]+`).
pub fn is_valid_step_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// One step of a pipeline.
pub struct StepDefinition {
    pub(crate) index: usize,
    pub(crate) model: String,
    pub(crate) pipeline: String,
    id: String,
    name: String,
    class: String,
    callback_class: Option<String>,
    step: Arc<dyn Step>,
    callback: Option<Arc<dyn CallbackStep>>,
    output: Option<String>,
    parameters: BTreeMap<String, String>,
    is_async: bool,
    viewable: bool,
    downloadable: bool,
    fail_on_error: bool,
    extra_attributes: Vec<(String, String)>,
    extra_elements: Vec<XmlElement>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("index", &self.index)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class", &self.class)
            .field("callback", &self.callback_class)
            .field("output", &self.output)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

impl StepDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position within the owning pipeline.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline
    }

    /// Registry key of the step implementation.
    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn callback_class(&self) -> Option<&str> {
        self.callback_class.as_deref()
    }

    /// Declared output path, if any.
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn is_viewable(&self) -> bool {
        self.viewable
    }

    pub fn is_downloadable(&self) -> bool {
        self.downloadable
    }

    /// Whether an `ERROR` result from this step stops the pipeline.
    pub fn fail_on_error(&self) -> bool {
        self.fail_on_error
    }

    pub fn extra_attributes(&self) -> &[(String, String)] {
        &self.extra_attributes
    }

    pub fn extra_elements(&self) -> &[XmlElement] {
        &self.extra_elements
    }

    /// Progress reported by the bound step, -1 when unknown.
    pub fn percentage(&self) -> i32 {
        self.step.percentage()
    }

    /// The step before this one in `pipeline`.
    pub fn previous<'p>(&self, pipeline: &'p Pipeline) -> Option<&'p StepDefinition> {
        self.index.checked_sub(1).and_then(|i| pipeline.step_at(i))
    }

    /// The step after this one in `pipeline`.
    pub fn next<'p>(&self, pipeline: &'p Pipeline) -> Option<&'p StepDefinition> {
        pipeline.step_at(self.index + 1)
    }

    /// Input this step reads when run within `pipeline`.
    ///
    /// The nearest earlier step with a declared output provides it; without
    /// one, the package's original file (relative to the package) is used.
    pub fn effective_input(&self, pipeline: &Pipeline, package: &PackageData) -> Option<String> {
        let upstream = pipeline.steps()[..self.index.min(pipeline.len())]
            .iter()
            .rev()
            .find_map(|step| step.output.clone());
        upstream.or_else(|| {
            package
                .original()
                .and_then(|original| package.relative_path(original))
        })
    }

    /// The [`StepInfo`] handed to the implementation.
    pub fn step_info(&self, pipeline: &Pipeline, package: &PackageData) -> StepInfo {
        let input = self.effective_input(pipeline, package);
        let output = self.output.clone().or_else(|| input.clone());
        StepInfo::new(
            self.id.clone(),
            self.name.clone(),
            input,
            output,
            self.parameters.clone(),
        )
    }

    /// Run this step against `package`.
    ///
    /// Never fails: an `Err` or a panic from the step becomes an `ERROR`
    /// result. The callback, if any, runs afterwards; its failures are
    /// logged and ignored.
    pub fn exec(&self, model: &Model, pipeline: &Pipeline, package: &mut PackageData) -> StepResult {
        let info = self.step_info(pipeline, package);
        debug!(
            model = %model.name(),
            pipeline = %pipeline.id(),
            step = %self.id,
            package_id = %package.id(),
            input = ?info.input(),
            output = ?info.output(),
            "Executing step"
        );

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.step.process(model, package, &info)
        }));
        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(step = %self.id, package_id = %package.id(), error = %e, "Step failed");
                StepResult::failed(model.name(), package, &info, format!("{e:#}"))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(step = %self.id, package_id = %package.id(), panic = %message, "Step panicked");
                StepResult::failed(model.name(), package, &info, message)
            }
        };
        if result.time_ms == 0 {
            result.time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        }

        if let Some(callback) = &self.callback {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                callback.process(model, package, &result, &info)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(step = %self.id, package_id = %package.id(), error = %e, "Callback failed")
                }
                Err(payload) => warn!(
                    step = %self.id,
                    package_id = %package.id(),
                    panic = %panic_message(payload.as_ref()),
                    "Callback panicked"
                ),
            }
        }

        result
    }

    /// XML rendering, optionally embedding a result of this step.
    pub fn to_xml(&self, result: Option<&StepResult>) -> XmlElement {
        let mut el = XmlElement::new("step")
            .attr("id", &self.id)
            .attr("name", &self.name)
            .attr("class", &self.class)
            .attr_opt("callback", self.callback_class.as_deref())
            .attr("async", self.is_async)
            .attr("viewable", self.viewable)
            .attr("downloadable", self.downloadable)
            .attr("fail-on-error", self.fail_on_error)
            .attr_opt("output", self.output.as_deref());
        for (name, value) in &self.extra_attributes {
            el = el.attr(name, value);
        }
        for (name, value) in &self.parameters {
            el.push(XmlElement::new("parameter").attr("name", name).attr("value", value));
        }
        for extra in &self.extra_elements {
            el.push(extra.clone());
        }
        if let Some(result) = result {
            el.push(result.to_xml());
        }
        el
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}

/// Builder for [`StepDefinition`].
#[derive(Debug, Clone)]
pub struct StepDefinitionBuilder {
    id: String,
    name: Option<String>,
    class: Option<String>,
    callback: Option<String>,
    output: Option<String>,
    parameters: BTreeMap<String, String>,
    is_async: bool,
    viewable: bool,
    downloadable: bool,
    fail_on_error: bool,
    extra_attributes: Vec<(String, String)>,
    extra_elements: Vec<XmlElement>,
}

impl StepDefinitionBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            class: None,
            callback: None,
            output: None,
            parameters: BTreeMap::new(),
            is_async: false,
            viewable: false,
            downloadable: false,
            fail_on_error: true,
            extra_attributes: Vec::new(),
            extra_elements: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name. Blank names fall back to the id.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into()).filter(|n| !n.trim().is_empty());
        self
    }

    /// Implementation key. Blank keys select the no-op step.
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into()).filter(|c| !c.trim().is_empty());
        self
    }

    pub fn callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into()).filter(|c| !c.trim().is_empty());
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into()).filter(|o| !o.trim().is_empty());
        self
    }

    pub fn is_async(mut self, value: bool) -> Self {
        self.is_async = value;
        self
    }

    pub fn viewable(mut self, value: bool) -> Self {
        self.viewable = value;
        self
    }

    pub fn downloadable(mut self, value: bool) -> Self {
        self.downloadable = value;
        self
    }

    pub fn fail_on_error(mut self, value: bool) -> Self {
        self.fail_on_error = value;
        self
    }

    /// Add a static parameter. Names are unique per step.
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "step '{}' has a parameter without a name",
                self.id
            )));
        }
        if self.parameters.contains_key(&name) {
            return Err(PipelineError::DuplicateId {
                kind: "parameter",
                id: name,
                parent: format!("step '{}'", self.id),
            });
        }
        self.parameters.insert(name, value.into());
        Ok(self)
    }

    /// Keep an unrecognized attribute. Names are unique per step.
    pub fn extra_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if self.extra_attributes.iter().any(|(n, _)| *n == name) {
            return Err(PipelineError::DuplicateId {
                kind: "attribute",
                id: name,
                parent: format!("step '{}'", self.id),
            });
        }
        self.extra_attributes.push((name, value.into()));
        Ok(self)
    }

    /// Keep an unrecognized child element.
    pub fn extra_element(mut self, element: XmlElement) -> Self {
        self.extra_elements.push(element);
        self
    }

    /// Validate and bind implementations from `registry`.
    pub fn build(self, registry: &StepRegistry) -> Result<StepDefinition> {
        if !is_valid_step_id(&self.id) {
            return Err(PipelineError::InvalidId {
                kind: "step",
                id: self.id,
            });
        }
        let class = self.class.unwrap_or_else(|| NOP_STEP.to_string());
        let step = registry.create_step(&class)?;
        let callback = self
            .callback
            .as_deref()
            .map(|key| registry.create_callback(key))
            .transpose()?;

        Ok(StepDefinition {
            index: 0,
            model: String::new(),
            pipeline: String::new(),
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            class,
            callback_class: self.callback,
            step,
            callback,
            output: self.output,
            parameters: self.parameters,
            is_async: self.is_async,
            viewable: self.viewable,
            downloadable: self.downloadable,
            fail_on_error: self.fail_on_error,
            extra_attributes: self.extra_attributes,
            extra_elements: self.extra_elements,
        })
    }
}
