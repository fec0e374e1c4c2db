//! Step results.

use std::fmt;
use std::path::PathBuf;

use oxpipe_store::{PackageData, XmlElement};
use serde::{Deserialize, Serialize};

use crate::step::StepInfo;

/// Outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultStatus {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Ok => write!(f, "OK"),
            ResultStatus::Warning => write!(f, "WARNING"),
            ResultStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// The result of running one step against one package.
///
/// Steps attach their own payload as XML elements in `info`. A result with
/// a `downloadable` path offers that file to callers once the step is done.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub model: String,
    pub package_id: String,
    pub step_id: String,
    pub step_name: String,
    pub status: ResultStatus,
    /// Wall-clock execution time in milliseconds.
    pub time_ms: u64,
    pub error: Option<String>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub downloadable: Option<PathBuf>,
    pub info: Vec<XmlElement>,
}

impl StepResult {
    /// An `OK` result for the step described by `info`.
    pub fn new(model: &str, package: &PackageData, info: &StepInfo) -> Self {
        Self {
            model: model.to_string(),
            package_id: package.id().to_string(),
            step_id: info.id().to_string(),
            step_name: info.name().to_string(),
            status: ResultStatus::Ok,
            time_ms: 0,
            error: None,
            input: info.input().map(str::to_string),
            output: info.output().map(str::to_string),
            downloadable: None,
            info: Vec::new(),
        }
    }

    /// An `ERROR` result carrying `message`.
    pub fn failed(model: &str, package: &PackageData, info: &StepInfo, message: impl Into<String>) -> Self {
        Self::new(model, package, info).with_error(message)
    }

    pub fn with_status(mut self, status: ResultStatus) -> Self {
        self.status = status;
        self
    }

    /// Record an error. Always switches the status to `ERROR`.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self.status = ResultStatus::Error;
        self
    }

    pub fn with_downloadable(mut self, path: impl Into<PathBuf>) -> Self {
        self.downloadable = Some(path.into());
        self
    }

    pub fn with_info(mut self, element: XmlElement) -> Self {
        self.info.push(element);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }

    pub fn is_downloadable(&self) -> bool {
        self.downloadable.is_some()
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut el = XmlElement::new("result")
            .attr("name", &self.step_name)
            .attr("id", &self.step_id)
            .attr("model", &self.model)
            .attr("package", &self.package_id)
            .attr("status", self.status)
            .attr("time", self.time_ms)
            .attr("downloadable", self.is_downloadable())
            .attr_opt("input", self.input.as_deref())
            .attr_opt("output", self.output.as_deref());
        if let Some(path) = &self.downloadable {
            el = el.attr("path", oxpipe_store::slash_path(path));
        }
        if let Some(error) = &self.error {
            el.push(XmlElement::new("error").with_text(error));
        }
        for info in &self.info {
            el.push(info.clone());
        }
        el
    }
}
