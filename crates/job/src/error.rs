//! Job-level failures, each wrapping the structured context of the layer
//! that produced it.

use thiserror::Error;

use endpoint::{EndpointError, PipelineError, UrlError};
use location::{DescriptorError, StoreError};
use retention::RetentionParseError;

/// Anything that can end a job command early.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job configuration is missing, inconsistent, or refuses the
    /// requested command.
    #[error("{0}")]
    Config(String),
    /// The persisted descriptor could not be read, parsed or written.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    /// A retention expression did not parse.
    #[error(transparent)]
    Retention(#[from] RetentionParseError),
    /// A location string did not parse.
    #[error(transparent)]
    Url(#[from] UrlError),
    /// A command failed on one of the endpoints.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// A snapshot store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The send/receive pipeline failed; the destination keeps its pre-run
    /// snapshot set.
    #[error("transfer failed: {0}")]
    Transfer(PipelineError),
    /// Writing rendered output failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The operator interrupted the run.
    #[error("interrupted")]
    Interrupted,
}

impl From<PipelineError> for JobError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Interrupted => JobError::Interrupted,
            other => JobError::Transfer(other),
        }
    }
}

impl JobError {
    /// Whether this failure came from the operator, not the system.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, JobError::Interrupted)
    }
}
