//! Broker-side job state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::{JobId, ParentRef};
use crate::options::ResolvedJobOptions;

/// Job state in the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is waiting in queue
    #[default]
    Waiting,
    /// Job becomes eligible at a later time
    Delayed,
    /// Flow parent waiting on its children
    WaitingChildren,
    /// Job is locked by a worker
    Active,
    /// Job completed successfully
    Completed,
    /// Job failed after its last attempt
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::WaitingChildren => "waiting_children",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Snapshot of one job as stored by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Logical job name
    pub name: String,
    pub queue: String,
    pub data: serde_json::Value,
    pub opts: ResolvedJobOptions,
    #[serde(default)]
    pub state: JobState,
    /// Last reported progress (0-100)
    #[serde(default)]
    pub progress: u8,
    /// Finished attempts (successful or failed)
    #[serde(default)]
    pub attempts_made: u32,
    /// Attempts handed to a worker, including in-flight ones
    #[serde(default)]
    pub attempts_started: u32,
    /// Times the job was recovered after its lock expired
    #[serde(default)]
    pub stalled_counter: u32,
    /// Enqueue time (unix ms)
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacktrace: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_id: Option<String>,
}

impl JobRecord {
    /// Attempt number of the current (or next) execution, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }
}

/// Children of a flow parent, split by whether they have completed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dependencies {
    /// Child job key -> return value
    pub processed: BTreeMap<String, serde_json::Value>,
    /// Child job keys still pending
    pub unprocessed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependenciesCount {
    pub processed: u64,
    pub unprocessed: u64,
}

/// Number of jobs per state in one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub waiting_children: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}
