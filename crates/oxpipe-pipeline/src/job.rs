//! Job tracking.
//!
//! A job is one execution request against one package: a whole pipeline
//! ([`PipelineJob`]) or a single step ([`StepJob`]). Jobs are shared between
//! the worker running them and whoever polls their status, so all mutable
//! state sits behind locks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use oxpipe_store::{PackageData, XmlElement};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::StepDefinition;
use crate::model::Model;
use crate::pipeline::Pipeline;
use crate::result::{ResultStatus, StepResult};

/// Inactivity threshold applied when none is configured.
pub const DEFAULT_MAX_INACTIVE: Duration = Duration::from_secs(60 * 60);

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Stopped,
    Processing,
    Completed,
    Error,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Stopped => write!(f, "STOPPED"),
            JobState::Processing => write!(f, "PROCESSING"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Error => write!(f, "ERROR"),
        }
    }
}

/// State, progress and message of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    state: JobState,
    percentage: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl JobStatus {
    /// A status with unknown progress.
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            percentage: -1,
            message: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    /// Progress in percent, -1 when unknown.
    pub fn percentage(&self) -> i32 {
        self.percentage
    }

    /// Set progress. Values above 100 become 100, negative values -1.
    pub fn set_percentage(&mut self, percentage: i32) {
        self.percentage = if percentage < 0 { -1 } else { percentage.min(100) };
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// True once the job reached `COMPLETED` or `ERROR`.
    pub fn has_completed(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Error)
    }

    pub fn to_xml(&self) -> XmlElement {
        let el = XmlElement::new("status")
            .attr("state", self.state)
            .attr("percentage", self.percentage)
            .attr("completed", self.has_completed());
        match &self.message {
            Some(message) => el.with_text(message),
            None => el,
        }
    }
}

/// Per-step outcome in a [`JobSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub status: ResultStatus,
    pub time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&StepResult> for StepSummary {
    fn from(result: &StepResult) -> Self {
        Self {
            step_id: result.step_id.clone(),
            status: result.status,
            time_ms: result.time_ms,
            error: result.error.clone(),
        }
    }
}

/// Serializable snapshot of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub model: String,
    pub pipeline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub package_id: String,
    pub started_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    pub results: Vec<StepSummary>,
}

/// Identity, timing and status shared by both job kinds.
#[derive(Debug)]
struct JobCore {
    id: String,
    started_at: DateTime<Utc>,
    max_inactive: Duration,
    package_id: String,
    slow: bool,
    status: Mutex<JobStatus>,
    download_path: Mutex<Option<String>>,
}

impl JobCore {
    fn new(package_id: String, initial: JobState) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            max_inactive: DEFAULT_MAX_INACTIVE,
            package_id,
            slow: false,
            status: Mutex::new(JobStatus::new(initial)),
            download_path: Mutex::new(None),
        }
    }

    fn is_inactive_at(&self, now: DateTime<Utc>) -> bool {
        let limit = TimeDelta::from_std(self.max_inactive).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.started_at) > limit
    }

    fn started(&self) {
        let mut status = self.status.lock();
        status.set_state(JobState::Processing);
        status.set_percentage(0);
    }

    fn completed(&self) {
        let mut status = self.status.lock();
        status.set_state(JobState::Completed);
        status.set_percentage(100);
    }

    fn failed(&self, message: &str) {
        let mut status = self.status.lock();
        status.set_state(JobState::Error);
        status.set_message(message);
    }

    fn xml(&self, kind: &str, model: &str, pipeline: &str) -> XmlElement {
        XmlElement::new("job")
            .attr("id", &self.id)
            .attr("type", kind)
            .attr("model", model)
            .attr("pipeline", pipeline)
            .attr("package", &self.package_id)
            .attr("start", self.started_at.to_rfc3339())
            .attr("slow", self.slow)
            .attr_opt("download", self.download_path.lock().clone())
            .child(self.status.lock().to_xml())
    }
}

macro_rules! job_accessors {
    () => {
        pub fn id(&self) -> &str {
            &self.core.id
        }

        pub fn started_at(&self) -> DateTime<Utc> {
            self.core.started_at
        }

        pub fn max_inactive(&self) -> Duration {
            self.core.max_inactive
        }

        /// Replace the inactivity threshold.
        pub fn with_max_inactive(mut self, max_inactive: Duration) -> Self {
            self.core.max_inactive = max_inactive;
            self
        }

        /// Queue this job on the slow lane.
        pub fn with_slow(mut self, slow: bool) -> Self {
            self.core.slow = slow;
            self
        }

        pub fn is_slow(&self) -> bool {
            self.core.slow
        }

        /// Whether more than the inactivity threshold passed since the start.
        pub fn is_inactive(&self) -> bool {
            self.core.is_inactive_at(Utc::now())
        }

        pub fn is_inactive_at(&self, now: DateTime<Utc>) -> bool {
            self.core.is_inactive_at(now)
        }

        pub fn model(&self) -> &Arc<Model> {
            &self.model
        }

        pub fn pipeline(&self) -> &Arc<Pipeline> {
            &self.pipeline
        }

        pub fn package_id(&self) -> &str {
            &self.core.package_id
        }

        /// Exclusive access to the package.
        pub fn package(&self) -> MutexGuard<'_, PackageData> {
            self.package.lock()
        }

        pub fn status(&self) -> JobStatus {
            self.core.status.lock().clone()
        }

        pub fn set_percentage(&self, percentage: i32) {
            self.core.status.lock().set_percentage(percentage);
        }

        pub fn set_message(&self, message: impl Into<String>) {
            self.core.status.lock().set_message(message);
        }

        /// Mark the job as processing with 0% progress.
        pub fn started(&self) {
            self.core.started();
        }

        /// Mark the job as completed with 100% progress.
        pub fn completed(&self) {
            self.core.completed();
        }

        /// Mark the job as failed.
        pub fn failed(&self, message: &str) {
            self.core.failed(message);
        }

        pub fn has_completed(&self) -> bool {
            self.core.status.lock().has_completed()
        }

        /// Path of the downloadable output, relative to the package root.
        pub fn download_path(&self) -> Option<String> {
            self.core.download_path.lock().clone()
        }

        pub fn set_download_path(&self, path: impl Into<String>) {
            *self.core.download_path.lock() = Some(path.into());
        }
    };
}

/// Execution of a whole pipeline against one package.
#[derive(Debug)]
pub struct PipelineJob {
    core: JobCore,
    model: Arc<Model>,
    pipeline: Arc<Pipeline>,
    package: Mutex<PackageData>,
    results: Mutex<Vec<StepResult>>,
}

impl PipelineJob {
    /// A new job, in `PROCESSING` state with unknown progress.
    pub fn new(model: Arc<Model>, pipeline: Arc<Pipeline>, package: PackageData) -> Self {
        Self {
            core: JobCore::new(package.id().to_string(), JobState::Processing),
            model,
            pipeline,
            package: Mutex::new(package),
            results: Mutex::new(Vec::new()),
        }
    }

    job_accessors!();

    pub fn add_result(&self, result: StepResult) {
        self.results.lock().push(result);
    }

    /// Results so far, in execution order.
    pub fn results(&self) -> Vec<StepResult> {
        self.results.lock().clone()
    }

    pub fn last_result(&self) -> Option<StepResult> {
        self.results.lock().last().cloned()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.core.id.clone(),
            model: self.model.name().to_string(),
            pipeline: self.pipeline.id().to_string(),
            step: None,
            package_id: self.core.package_id.clone(),
            started_at: self.core.started_at,
            status: self.status(),
            download_path: self.download_path(),
            results: self.results.lock().iter().map(StepSummary::from).collect(),
        }
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut el = self
            .core
            .xml("pipeline", self.model.name(), self.pipeline.id());
        for result in self.results.lock().iter() {
            el.push(result.to_xml());
        }
        el
    }
}

/// Execution of a single step against one package.
#[derive(Debug)]
pub struct StepJob {
    core: JobCore,
    model: Arc<Model>,
    pipeline: Arc<Pipeline>,
    step_index: usize,
    package: Mutex<PackageData>,
    result: Mutex<Option<StepResult>>,
}

impl StepJob {
    /// A new job for `step` of `pipeline`, in `STOPPED` state.
    pub fn new(model: Arc<Model>, pipeline: Arc<Pipeline>, step: &StepDefinition, package: PackageData) -> Self {
        Self {
            core: JobCore::new(package.id().to_string(), JobState::Stopped),
            model,
            step_index: step.index(),
            pipeline,
            package: Mutex::new(package),
            result: Mutex::new(None),
        }
    }

    job_accessors!();

    /// The step this job runs.
    pub fn step(&self) -> Option<&StepDefinition> {
        self.pipeline.step_at(self.step_index)
    }

    pub fn set_result(&self, result: StepResult) {
        *self.result.lock() = Some(result);
    }

    pub fn result(&self) -> Option<StepResult> {
        self.result.lock().clone()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.core.id.clone(),
            model: self.model.name().to_string(),
            pipeline: self.pipeline.id().to_string(),
            step: self.step().map(|s| s.id().to_string()),
            package_id: self.core.package_id.clone(),
            started_at: self.core.started_at,
            status: self.status(),
            download_path: self.download_path(),
            results: self.result.lock().iter().map(StepSummary::from).collect(),
        }
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut el = self
            .core
            .xml("step", self.model.name(), self.pipeline.id());
        if let Some(step) = self.step() {
            el = el.attr("step", step.id());
        }
        if let Some(result) = self.result.lock().as_ref() {
            el.push(result.to_xml());
        }
        el
    }
}

/// Either kind of job.
#[derive(Debug, Clone)]
pub enum Job {
    Pipeline(Arc<PipelineJob>),
    Step(Arc<StepJob>),
}

impl Job {
    pub fn id(&self) -> &str {
        match self {
            Job::Pipeline(job) => job.id(),
            Job::Step(job) => job.id(),
        }
    }

    pub fn package_id(&self) -> &str {
        match self {
            Job::Pipeline(job) => job.package_id(),
            Job::Step(job) => job.package_id(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Job::Pipeline(job) => job.status(),
            Job::Step(job) => job.status(),
        }
    }

    pub fn is_slow(&self) -> bool {
        match self {
            Job::Pipeline(job) => job.is_slow(),
            Job::Step(job) => job.is_slow(),
        }
    }

    pub fn has_completed(&self) -> bool {
        match self {
            Job::Pipeline(job) => job.has_completed(),
            Job::Step(job) => job.has_completed(),
        }
    }

    pub fn is_inactive_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Job::Pipeline(job) => job.is_inactive_at(now),
            Job::Step(job) => job.is_inactive_at(now),
        }
    }

    pub fn summary(&self) -> JobSummary {
        match self {
            Job::Pipeline(job) => job.summary(),
            Job::Step(job) => job.summary(),
        }
    }

    pub fn to_xml(&self) -> XmlElement {
        match self {
            Job::Pipeline(job) => job.to_xml(),
            Job::Step(job) => job.to_xml(),
        }
    }
}
