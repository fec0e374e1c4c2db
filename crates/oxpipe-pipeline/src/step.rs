//! Step and callback contracts.
//!
//! A [`Step`] does the actual work of a pipeline stage. It receives the
//! model it belongs to, the package it works on and a [`StepInfo`] with its
//! resolved input, output and parameters. Step failures are reported by
//! returning `Err` (or panicking); the engine turns both into an `ERROR`
//! [`StepResult`].
//!
//! A [`CallbackStep`] runs after the main step for side effects only. Its
//! failures are logged and never change the step's result.

use std::collections::BTreeMap;

use oxpipe_store::PackageData;

use crate::model::Model;
use crate::result::StepResult;

/// What a step needs to know about its own invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    id: String,
    name: String,
    input: Option<String>,
    output: Option<String>,
    parameters: BTreeMap<String, String>,
}

impl StepInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        input: Option<String>,
        output: Option<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            output,
            parameters,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Package-relative input path.
    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    /// Package-relative output path.
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn parameter_or<'a>(&'a self, name: &str, fallback: &'a str) -> &'a str {
        self.parameter(name).unwrap_or(fallback)
    }
}

/// A unit of processing within a pipeline.
pub trait Step: Send + Sync {
    fn process(
        &self,
        model: &Model,
        package: &mut PackageData,
        info: &StepInfo,
    ) -> anyhow::Result<StepResult>;

    /// Progress of the current invocation in percent, or -1 when unknown.
    fn percentage(&self) -> i32 {
        -1
    }
}

/// A best-effort hook invoked after a step produced its result.
pub trait CallbackStep: Send + Sync {
    fn process(
        &self,
        model: &Model,
        package: &mut PackageData,
        result: &StepResult,
        info: &StepInfo,
    ) -> anyhow::Result<()>;
}

/// Step used when a definition names no implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopStep;

impl Step for NopStep {
    fn process(
        &self,
        model: &Model,
        package: &mut PackageData,
        info: &StepInfo,
    ) -> anyhow::Result<StepResult> {
        Ok(StepResult::new(model.name(), package, info))
    }
}
