//! Streaming model definition parser.
//!
//! Reads a `model.xml` document in a single pass over xml-rs events and
//! builds the pipelines it declares:
//!
//! ```xml
//! <model owner="ops">
//!   <pipeline id="main" name="Main" accepts="application/xml" default="true">
//!     <step id="transform" class="xslt" callback="notify">
//!       <output file="out/result.xml"/>
//!       <parameter name="stylesheet" value="{_package_id}.xsl"/>
//!     </step>
//!   </pipeline>
//! </model>
//! ```
//!
//! `<pipelines>` is accepted as the root element as well. Unknown attributes
//! of pipelines and steps, and unknown child elements, are kept as extras.
//! Any error aborts the whole parse; nothing partial is returned.

use std::io::Read;

use oxpipe_store::XmlElement;
use tracing::{debug, warn};
use xml::attribute::OwnedAttribute;
use xml::reader::{ParserConfig, XmlEvent};

use crate::definition::StepDefinitionBuilder;
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::registry::StepRegistry;

/// File name of a model definition inside the model directory.
pub const MODEL_FILE: &str = "model.xml";

/// Deepest element nesting accepted.
pub const MAX_DEPTH: usize = 32;

/// Everything a model definition declares.
#[derive(Debug, Default)]
pub struct ModelDefinition {
    pub attributes: Vec<(String, String)>,
    pub pipelines: Vec<Pipeline>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Root,
    Pipeline,
    Step,
    Leaf,
    Extra,
    Ignored,
}

struct Handler<'a> {
    model: &'a str,
    registry: &'a StepRegistry,
    frames: Vec<Frame>,
    definition: ModelDefinition,
    pipeline: Option<Pipeline>,
    step: Option<StepDefinitionBuilder>,
    extras: Vec<XmlElement>,
}

/// Parse a model definition from `reader`.
///
/// `source_name` only appears in error messages.
pub fn parse<R: Read>(
    model: &str,
    source_name: &str,
    reader: R,
    registry: &StepRegistry,
) -> Result<ModelDefinition> {
    let events = ParserConfig::new()
        .trim_whitespace(true)
        .ignore_comments(true)
        .cdata_to_characters(true)
        .create_reader(reader);

    let mut handler = Handler {
        model,
        registry,
        frames: Vec::new(),
        definition: ModelDefinition::default(),
        pipeline: None,
        step: None,
        extras: Vec::new(),
    };

    for event in events {
        let event = event.map_err(|e| PipelineError::Xml {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => handler.start(&name.local_name, attributes)?,
            XmlEvent::EndElement { .. } => handler.end()?,
            XmlEvent::Characters(text) => handler.text(&text),
            _ => {}
        }
    }

    debug!(
        model = %model,
        source = %source_name,
        pipelines = handler.definition.pipelines.len(),
        "Parsed model definition"
    );
    Ok(handler.definition)
}

/// Parse a model definition held in memory.
pub fn parse_str(model: &str, xml: &str, registry: &StepRegistry) -> Result<ModelDefinition> {
    parse(model, "<string>", xml.as_bytes(), registry)
}

fn attribute_value<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

impl Handler<'_> {
    fn start(&mut self, name: &str, attributes: Vec<OwnedAttribute>) -> Result<()> {
        if self.frames.len() >= MAX_DEPTH {
            return Err(PipelineError::Configuration(format!(
                "model '{}' nests elements deeper than {MAX_DEPTH} levels",
                self.model
            )));
        }

        let frame = match (self.frames.last().copied(), name) {
            (None, "model" | "pipelines") => {
                self.definition.attributes = attributes
                    .into_iter()
                    .map(|a| (a.name.local_name, a.value))
                    .collect();
                Frame::Root
            }
            (None, other) => {
                return Err(PipelineError::Configuration(format!(
                    "model '{}' has unexpected root element <{other}>",
                    self.model
                )));
            }
            (Some(Frame::Root), "pipeline") => {
                self.pipeline = Some(self.start_pipeline(&attributes)?);
                Frame::Pipeline
            }
            (Some(Frame::Pipeline), "step") => {
                self.step = Some(self.start_step(attributes)?);
                Frame::Step
            }
            (Some(Frame::Step), "output") => {
                let output = attribute_value(&attributes, "file")
                    .or_else(|| attribute_value(&attributes, "folder"));
                if let Some(output) = output {
                    self.step = self.step.take().map(|step| step.output(output));
                }
                Frame::Leaf
            }
            (Some(Frame::Step), "parameter") => {
                let name = attribute_value(&attributes, "name").unwrap_or_default();
                let value = attribute_value(&attributes, "value").unwrap_or_default();
                if let Some(step) = self.step.take() {
                    self.step = Some(step.parameter(name, value)?);
                }
                Frame::Leaf
            }
            (Some(Frame::Pipeline | Frame::Step | Frame::Extra), _) => {
                let mut element = XmlElement::new(name);
                element.attributes = attributes
                    .into_iter()
                    .map(|a| (a.name.local_name, a.value))
                    .collect();
                self.extras.push(element);
                Frame::Extra
            }
            (Some(_), other) => {
                warn!(model = %self.model, element = %other, "Ignoring unexpected element");
                Frame::Ignored
            }
        };
        self.frames.push(frame);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        match self.frames.pop() {
            Some(Frame::Pipeline) => {
                if let Some(pipeline) = self.pipeline.take() {
                    if self
                        .definition
                        .pipelines
                        .iter()
                        .any(|p| p.id() == pipeline.id())
                    {
                        return Err(PipelineError::DuplicateId {
                            kind: "pipeline",
                            id: pipeline.id().to_string(),
                            parent: format!("model '{}'", self.model),
                        });
                    }
                    debug!(
                        model = %self.model,
                        pipeline = %pipeline.id(),
                        steps = pipeline.len(),
                        "Loaded pipeline"
                    );
                    self.definition.pipelines.push(pipeline);
                }
            }
            Some(Frame::Step) => {
                if let (Some(builder), Some(pipeline)) = (self.step.take(), self.pipeline.as_mut()) {
                    pipeline.add_step(builder.build(self.registry)?)?;
                }
            }
            Some(Frame::Extra) => {
                if let Some(element) = self.extras.pop() {
                    self.attach_extra(element);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if self.frames.last() == Some(&Frame::Extra)
            && let Some(element) = self.extras.last_mut()
        {
            match &mut element.text {
                Some(existing) => existing.push_str(text),
                None => element.text = Some(text.to_string()),
            }
        }
    }

    fn attach_extra(&mut self, element: XmlElement) {
        if let Some(parent) = self.extras.last_mut() {
            parent.push(element);
            return;
        }
        match self.frames.last() {
            Some(Frame::Step) => {
                if let Some(step) = self.step.take() {
                    self.step = Some(step.extra_element(element));
                }
            }
            Some(Frame::Pipeline) => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.add_extra_element(element);
                }
            }
            _ => {}
        }
    }

    fn start_pipeline(&self, attributes: &[OwnedAttribute]) -> Result<Pipeline> {
        let name = attribute_value(attributes, "name").unwrap_or_default();
        let mut pipeline = Pipeline::new(
            self.model,
            attribute_value(attributes, "id"),
            name,
            attribute_value(attributes, "accepts"),
        )?;
        if let Some(description) = attribute_value(attributes, "description") {
            pipeline = pipeline.with_description(description);
        }
        if let Some(default) = attribute_value(attributes, "default") {
            pipeline = pipeline.with_default(is_true(default));
        }
        for attribute in attributes {
            let key = attribute.name.local_name.as_str();
            if !matches!(key, "id" | "name" | "accepts" | "description" | "default") {
                pipeline.add_extra_attribute(key, &attribute.value)?;
            }
        }
        Ok(pipeline)
    }

    fn start_step(&self, attributes: Vec<OwnedAttribute>) -> Result<StepDefinitionBuilder> {
        let id = attribute_value(&attributes, "id").unwrap_or_default().trim();
        let mut builder = StepDefinitionBuilder::new(id);
        for attribute in attributes {
            let value = attribute.value;
            builder = match attribute.name.local_name.as_str() {
                "id" => builder,
                "name" => builder.name(value),
                "class" => builder.class(value.trim()),
                "callback" => builder.callback(value.trim()),
                "async" => builder.is_async(is_true(&value)),
                "viewable" => builder.viewable(is_true(&value)),
                "downloadable" => builder.downloadable(is_true(&value)),
                "fail-on-error" => builder.fail_on_error(!value.trim().eq_ignore_ascii_case("false")),
                other => builder.extra_attribute(other, value)?,
            };
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<model owner="ops" version="2">
  <!-- two pipelines -->
  <pipeline id="main" name="Main" default="true" description="Full run" color="blue">
    <step id="s1" name="First"/>
    <step id="s2" async="true" fail-on-error="false">
      <output file="out/a.xml"/>
      <parameter name="mode" value="strict"/>
      <parameter name="target" value="{_package_id}"/>
      <hint level="2">check <b>this</b></hint>
    </step>
    <notes>pipeline note</notes>
    <step id="s3" downloadable="true" viewable="TRUE"/>
  </pipeline>
  <pipeline name="Legacy" accepts="text/plain">
    <step id="only">
      <output folder="out"/>
    </step>
  </pipeline>
</model>
"#;

    #[test]
    fn test_parse_full_model() {
        let registry = StepRegistry::with_builtins();
        let def = parse_str("demo", MODEL, &registry).unwrap();

        assert_eq!(
            def.attributes,
            vec![
                ("owner".to_string(), "ops".to_string()),
                ("version".to_string(), "2".to_string())
            ]
        );
        assert_eq!(def.pipelines.len(), 2);

        let main = &def.pipelines[0];
        assert_eq!(main.id(), "main");
        assert!(main.is_default());
        assert_eq!(main.description(), Some("Full run"));
        assert_eq!(main.extra_attributes(), &[("color".to_string(), "blue".to_string())]);
        assert_eq!(main.extra_elements().len(), 1);
        assert_eq!(main.extra_elements()[0].text.as_deref(), Some("pipeline note"));

        let ids: Vec<_> = main.steps().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);

        let s1 = main.step("s1").unwrap();
        assert_eq!(s1.name(), "First");
        assert_eq!(s1.output(), None);
        assert!(s1.fail_on_error());

        let s2 = main.step("s2").unwrap();
        assert_eq!(s2.name(), "s2");
        assert!(s2.is_async());
        assert!(!s2.fail_on_error());
        assert_eq!(s2.output(), Some("out/a.xml"));
        assert_eq!(s2.parameter("mode"), Some("strict"));
        assert_eq!(s2.parameter("target"), Some("{_package_id}"));
        let hint = &s2.extra_elements()[0];
        assert_eq!(hint.name, "hint");
        assert_eq!(hint.attribute("level"), Some("2"));
        assert_eq!(hint.find("b").unwrap().text.as_deref(), Some("this"));

        let s3 = main.step("s3").unwrap();
        assert!(s3.is_downloadable());
        assert!(s3.is_viewable());

        let legacy = &def.pipelines[1];
        assert_eq!(legacy.id(), "Legacy");
        assert_eq!(legacy.accepts(), "text/plain");
        assert_eq!(legacy.step("only").unwrap().output(), Some("out"));
    }

    #[test]
    fn test_pipelines_root_accepted() {
        let registry = StepRegistry::with_builtins();
        let xml = r#"<pipelines><pipeline id="p" name="P"><step id="a"/></pipeline></pipelines>"#;
        let def = parse_str("demo", xml, &registry).unwrap();
        assert_eq!(def.pipelines.len(), 1);
    }

    #[test]
    fn test_unexpected_root_rejected() {
        let registry = StepRegistry::with_builtins();
        let err = parse_str("demo", "<config/>", &registry).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_duplicate_pipeline_rejected() {
        let registry = StepRegistry::with_builtins();
        let xml = r#"<model>
            <pipeline id="p" name="P"/>
            <pipeline id="p" name="Again"/>
        </model>"#;
        let err = parse_str("demo", xml, &registry).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateId { kind: "pipeline", .. }));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let registry = StepRegistry::with_builtins();
        let xml = r#"<model><pipeline id="p" name="P"><step id="a"/><step id="a"/></pipeline></model>"#;
        let err = parse_str("demo", xml, &registry).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateId { kind: "step", .. }));
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let registry = StepRegistry::with_builtins();
        let xml = r#"<model><pipeline id="p" name="P"><step id="a">
            <parameter name="x" value="1"/><parameter name="x" value="2"/>
        </step></pipeline></model>"#;
        assert!(parse_str("demo", xml, &registry).is_err());
    }

    #[test]
    fn test_unknown_class_aborts() {
        let registry = StepRegistry::with_builtins();
        let xml = r#"<model><pipeline id="p" name="P"><step id="a" class="xslt"/></pipeline></model>"#;
        let err = parse_str("demo", xml, &registry).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStep(k) if k == "xslt"));
    }

    #[test]
    fn test_missing_pipeline_name() {
        let registry = StepRegistry::with_builtins();
        let err = parse_str("demo", r#"<model><pipeline id="p"/></model>"#, &registry).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_invalid_step_id() {
        let registry = StepRegistry::with_builtins();
        let xml = r#"<model><pipeline id="p" name="P"><step id="a b"/></pipeline></model>"#;
        let err = parse_str("demo", xml, &registry).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidId { .. }));
    }

    #[test]
    fn test_malformed_xml() {
        let registry = StepRegistry::with_builtins();
        let err = parse_str("demo", "<model><pipeline", &registry).unwrap_err();
        assert!(matches!(err, PipelineError::Xml { .. }));
    }

    #[test]
    fn test_depth_limit() {
        let registry = StepRegistry::with_builtins();
        let mut xml = String::from(r#"<model><pipeline id="p" name="P">"#);
        for _ in 0..MAX_DEPTH {
            xml.push_str("<x>");
        }
        for _ in 0..MAX_DEPTH {
            xml.push_str("</x>");
        }
        xml.push_str("</pipeline></model>");
        let err = parse_str("demo", &xml, &registry).unwrap_err();
        assert!(err.is_configuration());
    }
}
