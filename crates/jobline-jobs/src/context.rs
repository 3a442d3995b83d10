//! Execution context handed to job handlers.

use std::sync::Arc;

use jobline_queue::ActiveJob;

use crate::logging::JobLogger;

/// Everything a handler gets besides its payload.
pub struct JobContext<D> {
    /// The dequeued job: metadata, progress reporting, children values
    pub job: ActiveJob,
    /// Shared data-access dependency of the worker
    pub data: Arc<D>,
    pub logger: JobLogger,
}

impl<D> JobContext<D> {
    pub fn new(job: ActiveJob, data: Arc<D>, logger: JobLogger) -> Self {
        Self { job, data, logger }
    }
}

impl<D> std::fmt::Debug for JobContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job)
            .field("logger", &self.logger)
            .finish_non_exhaustive()
    }
}
