//! Scheduler registry error types.

use jobline_jobs::{JobsError, ResolutionError};
use jobline_queue::QueueError;
use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Failed to register scheduler '{name}': {source}")]
    Registration {
        name: String,
        #[source]
        source: JobsError,
    },

    #[error("Failed to remove scheduler '{name}': {source}")]
    Removal {
        name: String,
        #[source]
        source: QueueError,
    },
}

impl SchedulerError {
    pub fn registration(name: impl Into<String>, source: impl Into<JobsError>) -> Self {
        Self::Registration {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn removal(name: impl Into<String>, source: QueueError) -> Self {
        Self::Removal {
            name: name.into(),
            source,
        }
    }

    pub fn unknown_template(template: impl Into<String>) -> Self {
        Self::Resolution(ResolutionError::UnknownTemplate(template.into()))
    }
}
