//! Owned XML element tree.
//!
//! Packages, results, jobs and model definitions all render themselves by
//! building an [`XmlElement`] and serializing it through `xml-rs`. The same
//! type carries unknown elements found in model definitions so they can be
//! written back untouched.

use std::io::Write;

use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use crate::Result;

/// A generic XML element: name, ordered attributes, text and children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((name.into(), value.to_string()));
        self
    }

    /// Append an attribute only when a value is present.
    pub fn attr_opt(self, name: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.attr(name, value),
            None => self,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    pub fn push(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    /// Value of the named attribute, if set.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given name.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Stream this element and its subtree into an existing writer.
    pub fn write_to<W: Write>(&self, writer: &mut EventWriter<W>) -> Result<()> {
        let mut start = XmlEvent::start_element(self.name.as_str());
        for (name, value) in &self.attributes {
            start = start.attr(name.as_str(), value.as_str());
        }
        writer.write(start)?;
        if let Some(text) = &self.text {
            writer.write(XmlEvent::characters(text))?;
        }
        for child in &self.children {
            child.write_to(writer)?;
        }
        writer.write(XmlEvent::end_element())?;
        Ok(())
    }

    /// Serialize without a document declaration.
    pub fn to_xml_string(&self) -> Result<String> {
        self.render(false)
    }

    /// Serialize with indentation, for display.
    pub fn to_pretty_string(&self) -> Result<String> {
        self.render(true)
    }

    fn render(&self, indent: bool) -> Result<String> {
        let mut buf = Vec::new();
        {
            let mut writer = EmitterConfig::new()
                .write_document_declaration(false)
                .perform_indent(indent)
                .create_writer(&mut buf);
            self.write_to(&mut writer)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
