//! Structured job logging.
//!
//! Every line carries the job ID, the registered job name and the queue so
//! log pipelines can follow one job across attempts.

use std::time::Duration;

use tracing::{error, info};

use jobline_models::JobId;

/// Logger handed to handlers through their context.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    job_name: String,
    queue: String,
}

impl JobLogger {
    pub fn new(job_id: &JobId, job_name: &str, queue: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            queue: queue.to_string(),
        }
    }

    pub fn log_start(&self, attempt: u32) {
        info!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            queue = %self.queue,
            attempt,
            "Job started"
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            queue = %self.queue,
            "Job progress: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            queue = %self.queue,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, duration: Duration) {
        info!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            queue = %self.queue,
            duration_ms = duration.as_millis() as u64,
            "Job completed"
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}
