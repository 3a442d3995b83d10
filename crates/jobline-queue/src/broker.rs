//! Broker abstraction.
//!
//! Every interaction with the durable store goes through [`Broker`]. The
//! production implementation is [`crate::RedisBroker`]; [`crate::MemoryBroker`]
//! keeps the same semantics in process memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobline_models::{
    Dependencies, FlowJob, FlowNodeHandle, JobCounts, JobId, JobRecord, KeepJobs, NewJob,
    SchedulerEntry, SchedulerSpec,
};

use crate::error::QueueResult;

/// Failure details recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub reason: String,
    pub stacktrace: Vec<String>,
}

impl JobFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            stacktrace: Vec::new(),
        }
    }

    pub fn with_stacktrace(mut self, stacktrace: Vec<String>) -> Self {
        self.stacktrace = stacktrace;
        self
    }
}

/// What the broker did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Job was put back (delayed or waiting) for another attempt
    Retrying,
    /// Attempts exhausted; job recorded as failed
    Failed,
}

/// Result of a stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledJobs {
    /// Returned to waiting
    pub recovered: Vec<JobId>,
    /// Stalled too often and moved to failed
    pub failed: Vec<JobId>,
}

impl StalledJobs {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

/// Durable queue storage.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Round-trip to the store.
    async fn ping(&self) -> QueueResult<()>;

    /// Enqueue one job. A job with an explicit `job_id` that already exists
    /// is left untouched and its ID returned.
    async fn add(&self, queue: &str, job: NewJob) -> QueueResult<JobId>;

    /// Enqueue several jobs in one round trip, preserving order.
    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> QueueResult<Vec<JobId>>;

    /// Atomically enqueue a job tree. Parents wait until all children complete.
    async fn add_flow(&self, flow: FlowJob) -> QueueResult<FlowNodeHandle>;

    /// Create or replace the scheduler `scheduler_id` and make sure exactly one
    /// iteration is pending for its next fire time.
    async fn upsert_scheduler(
        &self,
        queue: &str,
        scheduler_id: &str,
        spec: SchedulerSpec,
    ) -> QueueResult<SchedulerEntry>;

    /// Remove a scheduler and its pending iteration. Returns whether it existed.
    async fn remove_scheduler(&self, queue: &str, scheduler_id: &str) -> QueueResult<bool>;

    async fn get_scheduler(&self, queue: &str, scheduler_id: &str)
        -> QueueResult<Option<SchedulerEntry>>;

    async fn schedulers(&self, queue: &str) -> QueueResult<Vec<SchedulerEntry>>;

    /// Promote due delayed jobs, then lock and return the next job by
    /// priority and FIFO order.
    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<JobRecord>>;

    /// Renew the lock of an active job. Returns false if the lock was lost.
    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &str,
        lock_duration: Duration,
    ) -> QueueResult<bool>;

    /// Record a successful attempt and trim completed jobs to `keep`.
    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &str,
        return_value: &serde_json::Value,
        keep: KeepJobs,
    ) -> QueueResult<()>;

    /// Record a failed attempt. With `retry_delay` the job is retried after
    /// that delay; without it the job is failed and trimmed to `keep`.
    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &str,
        failure: &JobFailure,
        retry_delay: Option<Duration>,
        keep: KeepJobs,
    ) -> QueueResult<FailOutcome>;

    /// Return active jobs whose lock expired to waiting.
    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> QueueResult<StalledJobs>;

    async fn update_progress(&self, queue: &str, job_id: &JobId, progress: u8) -> QueueResult<()>;

    async fn get_job(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// Children of a flow parent and the values of those already completed.
    async fn dependencies(&self, queue: &str, job_id: &JobId) -> QueueResult<Dependencies>;

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts>;

    async fn close(&self) -> QueueResult<()>;
}

/// Creates broker connections for processes that do not own any.
pub trait BrokerConnector: Send + Sync + 'static {
    /// Open a connection dedicated to `queue` (or to flow submission when
    /// `queue` is `None`).
    fn connect(&self, queue: Option<&str>) -> QueueResult<Arc<dyn Broker>>;
}
