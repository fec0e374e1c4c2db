//! Error types for the pipeline engine.

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while loading models or running jobs.
///
/// Step failures are not errors at this level: they travel inside a
/// [`StepResult`](crate::StepResult) with `ERROR` status.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or incomplete model definition.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// An id that must be unique within its parent was declared twice.
    #[error("Duplicate {kind} '{id}' in {parent}")]
    DuplicateId {
        kind: &'static str,
        id: String,
        parent: String,
    },

    /// An id that does not match the allowed pattern.
    #[error("Invalid {kind} id '{id}'")]
    InvalidId { kind: &'static str, id: String },

    /// No step implementation registered under this key.
    #[error("Unknown step implementation '{0}'")]
    UnknownStep(String),

    /// No callback implementation registered under this key.
    #[error("Unknown callback implementation '{0}'")]
    UnknownCallback(String),

    /// The model definition is not well-formed XML.
    #[error("XML error in {source_name}: {message}")]
    Xml {
        source_name: String,
        message: String,
    },

    /// Failed to read a model file.
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Model not found or not loadable.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Pipeline not found in a model.
    #[error("Pipeline '{pipeline}' not found in model '{model}'")]
    PipelineNotFound { model: String, pipeline: String },

    /// Step not found in a pipeline.
    #[error("Step '{step}' not found in pipeline '{pipeline}'")]
    StepNotFound { pipeline: String, step: String },

    /// Job not found in the registry.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Package store failure.
    #[error(transparent)]
    Store(#[from] oxpipe_store::StoreError),

    /// The job manager is not accepting work.
    #[error("Job manager is shut down")]
    Shutdown,
}

impl PipelineError {
    /// Whether this error stems from a bad model definition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::DuplicateId { .. }
                | PipelineError::InvalidId { .. }
                | PipelineError::UnknownStep(_)
                | PipelineError::UnknownCallback(_)
                | PipelineError::Xml { .. }
        )
    }
}
