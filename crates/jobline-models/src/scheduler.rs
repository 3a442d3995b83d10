//! Recurring trigger (scheduler) definitions stored in the broker.

use serde::{Deserialize, Serialize};

use crate::options::{RepeatOptions, ResolvedJobOptions};

/// What a scheduler enqueues each time it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSpec {
    pub repeat: RepeatOptions,
    /// Logical job name produced on every iteration
    pub job_name: String,
    pub data: serde_json::Value,
    pub opts: ResolvedJobOptions,
}

/// A scheduler as persisted by the broker, keyed by its scheduler ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    pub id: String,
    pub spec: SchedulerSpec,
    /// Iterations produced so far
    #[serde(default)]
    pub count: u64,
    /// Fire time of the pending iteration (unix ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_millis: Option<i64>,
    /// ID of the pending iteration job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_job_id: Option<String>,
}

impl SchedulerEntry {
    pub fn new(id: impl Into<String>, spec: SchedulerSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            count: 0,
            next_millis: None,
            next_job_id: None,
        }
    }

    /// Deterministic job ID for the iteration firing at `millis`.
    pub fn iteration_job_id(&self, millis: i64) -> String {
        format!("repeat:{}:{}", self.id, millis)
    }
}
