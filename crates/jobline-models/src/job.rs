//! Job identifiers and enqueue requests.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::options::ResolvedJobOptions;

/// Broker-assigned identifier of one enqueued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Handle returned to callers after a job has been enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Broker-assigned job ID
    pub id: JobId,
    /// Logical job name (the registered job identifier)
    pub name: String,
    /// Queue the job was enqueued on
    pub queue: String,
}

/// Reference from a child job to its parent in a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    /// Parent job ID
    pub id: JobId,
    /// Queue the parent lives on
    pub queue: String,
}

/// A job ready to be handed to the broker.
///
/// Options are already resolved, so the broker never applies defaults of
/// its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Logical job name
    pub name: String,
    /// Validated payload
    pub data: serde_json::Value,
    /// Fully merged execution policy
    pub opts: ResolvedJobOptions,
    /// Scheduler that produced this job, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_id: Option<String>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: serde_json::Value, opts: ResolvedJobOptions) -> Self {
        Self {
            name: name.into(),
            data,
            opts,
            scheduler_id: None,
        }
    }

    /// Mark the job as an iteration of a scheduler.
    pub fn with_scheduler(mut self, scheduler_id: impl Into<String>) -> Self {
        self.scheduler_id = Some(scheduler_id.into());
        self
    }
}
