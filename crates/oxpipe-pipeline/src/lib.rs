//! Model loading, step execution and job orchestration for oxpipe.
//!
//! A *model* is a directory holding a `model.xml` that declares pipelines;
//! each pipeline is an ordered list of steps bound to implementations from a
//! [`StepRegistry`]. Running a pipeline against a package chains the steps:
//! each one reads the nearest earlier declared output.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Engine                                                  │
//! │  - ModelCatalog  → Model → Pipeline → StepDefinition     │
//! │  - JobManager    → fast/slow tokio workers               │
//! │  - JobRegistry   → active packages for cleanup           │
//! │  - CleanupService (oxpipe-store)                         │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod definition;
pub mod engine;
pub mod error;
pub mod job;
pub mod loader;
pub mod manager;
pub mod model;
pub mod params;
pub mod pipeline;
pub mod registry;
pub mod result;
pub mod step;
pub mod template;

pub use catalog::ModelCatalog;
pub use definition::{StepDefinition, StepDefinitionBuilder, is_valid_step_id};
pub use engine::Engine;
pub use error::{PipelineError, Result};
pub use job::{Job, JobState, JobStatus, JobSummary, PipelineJob, StepJob, StepSummary};
pub use loader::{MODEL_FILE, ModelDefinition};
pub use manager::{JobManager, JobRegistry, JobSettings, process_pipeline_job, process_step_job};
pub use model::Model;
pub use params::StepParameters;
pub use pipeline::{DEFAULT_ACCEPTS, Pipeline};
pub use registry::{CallbackFactory, NOP_STEP, StepFactory, StepRegistry};
pub use result::{ResultStatus, StepResult};
pub use step::{CallbackStep, NopStep, Step, StepInfo};
pub use template::{ParameterTemplate, Segment, resolve as resolve_template};
