//! Shared data models for the jobline job orchestration core.
//!
//! This crate provides Serde-serializable types for:
//! - Job identifiers and handles
//! - Execution policy (priority, attempts, backoff, retention)
//! - Repeat and scheduler specifications
//! - Flow (job tree) wire format
//! - Broker-side job records

pub mod flow;
pub mod job;
pub mod options;
pub mod record;
pub mod scheduler;

// Re-export common types
pub use flow::{FlowJob, FlowNodeHandle};
pub use job::{JobHandle, JobId, NewJob, ParentRef};
pub use options::{Backoff, JobOptions, KeepJobs, RepeatOptions, ResolvedJobOptions};
pub use record::{Dependencies, DependenciesCount, JobCounts, JobRecord, JobState};
pub use scheduler::{SchedulerEntry, SchedulerSpec};
