//! Job registry error types.

use jobline_queue::QueueError;
use thiserror::Error;

pub type JobsResult<T> = Result<T, JobsError>;

/// Why a payload was rejected.
#[derive(Debug, Error)]
pub enum SchemaViolation {
    #[error("payload does not match the job's input type: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("{0}")]
    Rules(#[source] validator::ValidationErrors),
}

/// A job or queue could not be located.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("No queue registered for job '{0}'")]
    NoQueue(String),

    #[error("Unknown job '{0}'")]
    UnknownJob(String),

    #[error("Unknown scheduler template '{0}'")]
    UnknownTemplate(String),
}

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("Validation failed for job '{job_id}': {violation}")]
    Validation {
        job_id: String,
        #[source]
        violation: SchemaViolation,
    },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Job '{job_id}' failed: {source}")]
    Execution {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Job '{0}' is already registered")]
    DuplicateJob(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl JobsError {
    pub fn validation(job_id: impl Into<String>, violation: SchemaViolation) -> Self {
        Self::Validation {
            job_id: job_id.into(),
            violation,
        }
    }

    pub fn execution(job_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Execution {
            job_id: job_id.into(),
            source,
        }
    }

    /// Whether the error came from the caller's input rather than the system.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::Resolution(_) | Self::DuplicateJob(_))
    }
}
