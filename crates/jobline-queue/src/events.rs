//! Worker lifecycle events.

use std::time::Duration;

use jobline_models::JobId;

/// Events emitted by consumers onto a broadcast channel.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Consumer connected and is fetching
    Ready { queue: String },
    /// Job picked up
    Active {
        queue: String,
        job_id: JobId,
        name: String,
        attempt: u32,
    },
    Progress {
        queue: String,
        job_id: JobId,
        progress: u8,
    },
    Completed {
        queue: String,
        job_id: JobId,
        name: String,
        duration: Duration,
    },
    Failed {
        queue: String,
        job_id: JobId,
        name: String,
        error: String,
        stacktrace: Vec<String>,
        data: serde_json::Value,
        attempt: u32,
        will_retry: bool,
    },
    /// Consumer-level error. `job_id` is set when a job left the active
    /// set without a recorded outcome.
    Error {
        queue: String,
        error: String,
        job_id: Option<JobId>,
    },
    /// Jobs whose lock expired were returned to waiting or failed
    Stalled {
        queue: String,
        recovered: usize,
        failed: usize,
    },
    Closing { queue: String },
    Closed { queue: String },
}

impl WorkerEvent {
    pub fn queue(&self) -> &str {
        match self {
            WorkerEvent::Ready { queue }
            | WorkerEvent::Active { queue, .. }
            | WorkerEvent::Progress { queue, .. }
            | WorkerEvent::Completed { queue, .. }
            | WorkerEvent::Failed { queue, .. }
            | WorkerEvent::Error { queue, .. }
            | WorkerEvent::Stalled { queue, .. }
            | WorkerEvent::Closing { queue }
            | WorkerEvent::Closed { queue } => queue,
        }
    }

    /// Short name used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Ready { .. } => "ready",
            WorkerEvent::Active { .. } => "active",
            WorkerEvent::Progress { .. } => "progress",
            WorkerEvent::Completed { .. } => "completed",
            WorkerEvent::Failed { .. } => "failed",
            WorkerEvent::Error { .. } => "error",
            WorkerEvent::Stalled { .. } => "stalled",
            WorkerEvent::Closing { .. } => "closing",
            WorkerEvent::Closed { .. } => "closed",
        }
    }
}
